use log::{debug, info};
use x11rb::{
    atom_manager,
    connection::{Connection, RequestConnection},
    errors::ConnectionError,
    protocol::{
        xfixes,
        xfixes::{select_selection_input, SelectionEventMask},
        xproto::{
            Atom, AtomEnum, ChangeWindowAttributesAux, ConnectionExt, CreateWindowAux, EventMask,
            GetPropertyReply, PropMode, SelectionNotifyEvent, Timestamp, Window, WindowClass,
            SELECTION_NOTIFY_EVENT,
        },
        Event,
    },
    rust_connection::{DefaultStream, RustConnection},
    wrapper::ConnectionExt as WrapperConnExt,
};

use crate::{history::ClipFormat, CliError};

atom_manager! {
    pub Atoms:
    AtomsCookie {
        _NET_WM_NAME,
        UTF8_STRING,

        CLIPCLOP_SEL,
        CLIPBOARD,
        TARGETS,
        INCR,
        image_png: b"image/png",
    }
}

/// The daemon's X11 connection: the interned atom set, the hidden event
/// window all selection traffic is routed through, and thin wrappers over
/// the requests the selection engine needs.
pub struct X {
    conn: RustConnection,
    window: Window,
    atoms: Atoms,
    max_prop_size: usize,
}

impl X {
    pub fn connect() -> Result<Self, CliError> {
        let (conn, screen_num) = x11rb::connect(None)?;
        let root = conn.setup().roots[screen_num].root;
        // The setup reports the ceiling in 4-byte units, so this is a
        // conservative quarter of the true request limit.
        let max_prop_size = usize::from(conn.setup().maximum_request_length);
        debug!("X11 connection established.");

        conn.prefetch_extension_information(xfixes::X11_EXTENSION_NAME)?;
        let atoms = Atoms::new(&conn)?.reply()?;
        debug!("Atom internment complete.");

        let window = conn.generate_id()?;
        conn.create_window(
            x11rb::COPY_DEPTH_FROM_PARENT,
            window,
            root,
            0,
            0,
            1,
            1,
            0,
            WindowClass::INPUT_OUTPUT,
            x11rb::COPY_FROM_PARENT,
            &CreateWindowAux::default(),
        )?;
        conn.change_property8(
            PropMode::REPLACE,
            window,
            atoms._NET_WM_NAME,
            atoms.UTF8_STRING,
            b"clipclop",
        )?;
        debug!("Created event window.");

        conn.extension_information(xfixes::X11_EXTENSION_NAME)?
            .ok_or(CliError::X11NoXfixes)?;
        xfixes::query_version(&conn, 5, 0)?.reply()?;

        // Primary selections are deliberately not observed; only the
        // clipboard feeds the history.
        select_selection_input(
            &conn,
            window,
            atoms.CLIPBOARD,
            SelectionEventMask::SET_SELECTION_OWNER,
        )?
        .check()?;
        conn.flush()?;
        info!("Listening for clipboard selection changes.");

        Ok(Self {
            conn,
            window,
            atoms,
            max_prop_size,
        })
    }

    pub fn atoms(&self) -> Atoms {
        self.atoms
    }

    pub fn max_prop_size(&self) -> usize {
        self.max_prop_size
    }

    pub fn is_event_window(&self, window: Window) -> bool {
        self.window == window
    }

    pub fn stream(&self) -> &DefaultStream {
        self.conn.stream()
    }

    pub fn poll_event(&self) -> Result<Option<Event>, ConnectionError> {
        self.conn.poll_for_event()
    }

    pub fn flush(&self) -> Result<(), ConnectionError> {
        self.conn.flush()
    }

    /// Asks the selection's owner to convert it to `target` into `property`
    /// on our event window.
    pub fn convert_selection(
        &self,
        selection: Atom,
        target: Atom,
        property: Atom,
        time: Timestamp,
    ) -> Result<(), CliError> {
        self.conn
            .convert_selection(self.window, selection, target, property, time)?
            .check()?;
        Ok(())
    }

    /// Delete-on-read property fetch; deleting is what drives the INCR
    /// handshake forward.
    pub fn get_property(
        &self,
        window: Window,
        property: Atom,
        type_: impl Into<Atom>,
    ) -> Result<GetPropertyReply, CliError> {
        Ok(self
            .conn
            .get_property(true, window, property, type_, 0, u32::MAX)?
            .reply()?)
    }

    pub fn change_property8(
        &self,
        mode: PropMode,
        window: Window,
        property: Atom,
        type_: Atom,
        data: &[u8],
    ) -> Result<(), CliError> {
        self.conn
            .change_property8(mode, window, property, type_, data)?
            .check()?;
        Ok(())
    }

    pub fn change_property32(
        &self,
        mode: PropMode,
        window: Window,
        property: Atom,
        type_: Atom,
        data: &[u32],
    ) -> Result<(), CliError> {
        self.conn
            .change_property32(mode, window, property, type_, data)?
            .check()?;
        Ok(())
    }

    pub fn delete_property(&self, window: Window, property: Atom) -> Result<(), CliError> {
        self.conn.delete_property(window, property)?.check()?;
        Ok(())
    }

    /// Adds or removes our interest in `PropertyNotify` events on a window.
    pub fn select_input(&self, window: Window, mask: EventMask) -> Result<(), CliError> {
        self.conn
            .change_window_attributes(window, &ChangeWindowAttributesAux::new().event_mask(mask))?
            .check()?;
        Ok(())
    }

    pub fn send_selection_notify(
        &self,
        sequence: u16,
        requestor: Window,
        selection: Atom,
        target: Atom,
        property: Atom,
        time: Timestamp,
    ) -> Result<(), CliError> {
        self.conn
            .send_event(
                false,
                requestor,
                EventMask::NO_EVENT,
                SelectionNotifyEvent {
                    response_type: SELECTION_NOTIFY_EVENT,
                    sequence,
                    time,
                    requestor,
                    selection,
                    target,
                    property,
                },
            )?
            .check()?;
        Ok(())
    }

    /// Claims both selections so a paste keeps working even after the
    /// source application exits.
    pub fn become_selection_owner(&self) -> Result<(), CliError> {
        self.conn
            .set_selection_owner(self.window, AtomEnum::PRIMARY.into(), x11rb::CURRENT_TIME)?
            .check()?;
        self.conn
            .set_selection_owner(self.window, self.atoms.CLIPBOARD, x11rb::CURRENT_TIME)?
            .check()?;
        Ok(())
    }

    pub fn atom_to_format(&self, atom: Atom) -> ClipFormat {
        if atom == self.atoms.UTF8_STRING || atom == Atom::from(AtomEnum::STRING) {
            ClipFormat::String
        } else if atom == self.atoms.image_png {
            ClipFormat::Png
        } else {
            ClipFormat::None
        }
    }

    pub fn format_to_atom(&self, format: ClipFormat) -> Atom {
        match format {
            ClipFormat::Png => self.atoms.image_png,
            _ => AtomEnum::STRING.into(),
        }
    }
}
