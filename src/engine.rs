use std::{collections::HashMap, sync::Arc, time::SystemTime};

use log::{debug, info, trace, warn};
use x11rb::protocol::{
    xfixes,
    xproto::{
        Atom, AtomEnum, EventMask, GetPropertyReply, GetPropertyType, PropMode, Property,
        PropertyNotifyEvent, SelectionNotifyEvent, SelectionRequestEvent, Window,
    },
    Event,
};

use crate::{
    history::{Clip, ClipFormat, History},
    x::{Atoms, X},
    CliError,
};

// The INCR size hint is advisory; cap what we preallocate from it.
const MAX_INCR_PREALLOC: usize = 1 << 26;

/// An incoming INCR transfer, keyed by the requestor (our event window).
/// The original target is retained so the finished clip gets its format.
struct InboundTransfer {
    data: Vec<u8>,
    target: Atom,
    selection: Atom,
}

/// An outgoing INCR transfer, keyed by the peer's window. `cursor` is the
/// next byte to write; `None` means the final zero-length chunk went out
/// and the next property deletion completes the teardown.
struct OutboundTransfer {
    data: Arc<[u8]>,
    cursor: Option<usize>,
    target: Atom,
    property: Atom,
}

/// The selection-protocol state machine. Drives the two-step fetch
/// (targets, then data) when a peer takes ownership, and serves our
/// selected clip to requestors, chunking through INCR in both directions
/// when a payload exceeds the property size ceiling.
pub struct Engine {
    history: Arc<History>,
    min_clip_size: usize,
    inbound: HashMap<Window, InboundTransfer>,
    outbound: HashMap<Window, OutboundTransfer>,
}

impl Engine {
    pub fn new(history: Arc<History>, min_clip_size: usize) -> Self {
        Self {
            history,
            min_clip_size,
            inbound: HashMap::new(),
            outbound: HashMap::new(),
        }
    }

    pub fn handle_event(&mut self, x: &X, event: Event) -> Result<(), CliError> {
        match event {
            Event::XfixesSelectionNotify(event) => self.handle_owner_change(x, event),
            Event::SelectionNotify(event) => self.handle_conversion_reply(x, event),
            Event::SelectionRequest(event) => self.handle_selection_request(x, event),
            Event::SelectionClear(event) => {
                // A peer took ownership; the xfixes notification that
                // follows starts the next capture.
                debug!("Lost ownership of selection {}.", event.selection);
                Ok(())
            }
            Event::PropertyNotify(event) => self.handle_property_notify(x, event),
            Event::Error(e) => Err(e.into()),
            event => {
                trace!("Ignoring unknown X11 event: {event:?}");
                Ok(())
            }
        }
    }

    /// Someone took ownership of the clipboard: ask them what targets they
    /// can produce.
    fn handle_owner_change(
        &mut self,
        x: &X,
        event: xfixes::SelectionNotifyEvent,
    ) -> Result<(), CliError> {
        if x.is_event_window(event.owner) {
            debug!("Ignoring selection notification from ourselves.");
            return Ok(());
        }

        let atoms = x.atoms();
        x.convert_selection(
            event.selection,
            atoms.TARGETS,
            atoms.TARGETS,
            event.selection_timestamp,
        )
    }

    /// The owner answered one of our conversion requests: either the target
    /// list (stage one) or the selection data itself (stage two).
    fn handle_conversion_reply(
        &mut self,
        x: &X,
        event: SelectionNotifyEvent,
    ) -> Result<(), CliError> {
        let atoms = x.atoms();

        if event.property == x11rb::NONE {
            debug!("Selection conversion refused by the owner.");
            return Ok(());
        }

        if event.property == atoms.TARGETS {
            let reply = x.get_property(event.requestor, atoms.TARGETS, AtomEnum::ATOM)?;
            let target = choose_target(&atoms, &reply);
            debug!("Requesting selection conversion to target {target}.");
            return x.convert_selection(event.selection, target, atoms.CLIPCLOP_SEL, event.time);
        }

        let reply = x.get_property(event.requestor, atoms.CLIPCLOP_SEL, GetPropertyType::ANY)?;
        if reply.type_ == atoms.INCR {
            let hint = reply.value32().into_iter().flatten().next().unwrap_or(0);
            self.inbound.insert(
                event.requestor,
                InboundTransfer {
                    data: Vec::with_capacity(
                        usize::try_from(hint).unwrap_or(0).min(MAX_INCR_PREALLOC),
                    ),
                    target: event.target,
                    selection: event.selection,
                },
            );
            x.delete_property(event.requestor, atoms.CLIPCLOP_SEL)?;
            x.select_input(event.requestor, EventMask::PROPERTY_CHANGE)?;
            debug!("Waiting for inbound INCR transfer ({hint} byte hint).");
        } else {
            if reply.value.is_empty() || reply.value.len() < self.min_clip_size {
                debug!(
                    "Dropping {} byte selection below the minimum clip size.",
                    reply.value.len()
                );
                return Ok(());
            }
            let format = x.atom_to_format(reply.type_);
            self.capture(x, reply.value, format, event.selection);
        }
        Ok(())
    }

    /// A peer wants our selection: advertise targets, hand the bytes over
    /// in one write, or start an INCR transfer.
    fn handle_selection_request(
        &mut self,
        x: &X,
        event: SelectionRequestEvent,
    ) -> Result<(), CliError> {
        let atoms = x.atoms();
        let Some(clip) = self.history.selected() else {
            debug!("Nothing in history to share.");
            return x.send_selection_notify(
                event.sequence,
                event.requestor,
                event.selection,
                event.target,
                x11rb::NONE,
                event.time,
            );
        };

        let property = if event.property == x11rb::NONE {
            debug!("Obsolete requestor detected.");
            event.target
        } else {
            event.property
        };

        if event.target == atoms.TARGETS {
            x.change_property32(
                PropMode::REPLACE,
                event.requestor,
                property,
                AtomEnum::ATOM.into(),
                &[x.format_to_atom(clip.format), atoms.TARGETS],
            )?;
        } else if clip.value.len() < x.max_prop_size() {
            // The property type echoes the requested target: some peers ask
            // for a target they never saw advertised and ignore anything
            // typed differently.
            x.change_property8(
                PropMode::REPLACE,
                event.requestor,
                property,
                event.target,
                &clip.value,
            )?;
        } else {
            let total = u32::try_from(clip.value.len()).unwrap_or(u32::MAX);
            x.change_property32(
                PropMode::REPLACE,
                event.requestor,
                property,
                atoms.INCR,
                &[total],
            )?;
            x.select_input(event.requestor, EventMask::PROPERTY_CHANGE)?;
            self.outbound.insert(
                event.requestor,
                OutboundTransfer {
                    data: Arc::clone(&clip.value),
                    cursor: Some(0),
                    target: event.target,
                    property,
                },
            );
            debug!(
                "Starting outbound INCR transfer of {total} bytes to window {}.",
                event.requestor
            );
        }

        x.send_selection_notify(
            event.sequence,
            event.requestor,
            event.selection,
            event.target,
            property,
            event.time,
        )
    }

    fn handle_property_notify(&mut self, x: &X, event: PropertyNotifyEvent) -> Result<(), CliError> {
        if event.state == Property::NEW_VALUE {
            if !x.is_event_window(event.window) || event.atom != x.atoms().CLIPCLOP_SEL {
                trace!("Ignoring new value on property {}.", event.atom);
                return Ok(());
            }
            self.continue_inbound(x, event.window)
        } else if event.state == Property::DELETE {
            if x.is_event_window(event.window) {
                // Deletions of our own properties come from our own
                // delete-on-read fetches.
                return Ok(());
            }
            self.continue_outbound(x, event)
        } else {
            trace!("Ignoring property state change: {:?}.", event.state);
            Ok(())
        }
    }

    /// The owner wrote the next inbound INCR chunk. A zero-length chunk
    /// finishes the transfer.
    fn continue_inbound(&mut self, x: &X, window: Window) -> Result<(), CliError> {
        if !self.inbound.contains_key(&window) {
            trace!("No inbound INCR transfer to continue for window {window}.");
            return Ok(());
        }

        let reply = x.get_property(window, x.atoms().CLIPCLOP_SEL, GetPropertyType::ANY)?;
        if reply.value.is_empty() {
            let Some(transfer) = self.inbound.remove(&window) else {
                return Ok(());
            };
            x.select_input(window, EventMask::NO_EVENT)?;
            if transfer.data.is_empty() {
                warn!("Dropping empty INCR selection.");
                return Ok(());
            }
            debug!(
                "Inbound INCR transfer complete ({} bytes).",
                transfer.data.len()
            );
            let format = x.atom_to_format(transfer.target);
            self.capture(x, transfer.data, format, transfer.selection);
        } else if let Some(transfer) = self.inbound.get_mut(&window) {
            debug!("Read {} bytes for inbound INCR transfer.", reply.value.len());
            transfer.data.extend_from_slice(&reply.value);
        }
        Ok(())
    }

    /// The peer consumed the previous outbound chunk by deleting the
    /// property; write the next one.
    fn continue_outbound(&mut self, x: &X, event: PropertyNotifyEvent) -> Result<(), CliError> {
        let Some(transfer) = self.outbound.get_mut(&event.window) else {
            trace!(
                "No outbound INCR transfer to continue for window {}.",
                event.window
            );
            return Ok(());
        };
        if event.atom != transfer.property {
            trace!("Ignoring deletion of unrelated property {}.", event.atom);
            return Ok(());
        }

        let Some(cursor) = transfer.cursor else {
            // The zero-length chunk already went out; this deletion ends
            // the handshake.
            self.outbound.remove(&event.window);
            x.select_input(event.window, EventMask::NO_EVENT)?;
            debug!("Outbound INCR transfer to window {} complete.", event.window);
            return Ok(());
        };

        let remaining = transfer.data.len() - cursor;
        let len = remaining.min(x.max_prop_size());
        // The first write replaces; every later one, including the final
        // zero-length chunk, appends.
        let mode = if cursor == 0 {
            PropMode::REPLACE
        } else {
            PropMode::APPEND
        };
        x.change_property8(
            mode,
            event.window,
            transfer.property,
            transfer.target,
            &transfer.data[cursor..cursor + len],
        )?;
        if remaining == 0 {
            transfer.cursor = None;
        } else {
            transfer.cursor = Some(cursor + len);
        }
        Ok(())
    }

    /// A complete clip came in: record it and take both selections so a
    /// paste is served by us even after the source application exits.
    fn capture(&self, x: &X, value: Vec<u8>, format: ClipFormat, selection: Atom) {
        let source = if selection == x.atoms().CLIPBOARD {
            "clipboard"
        } else {
            "unknown"
        };
        let clip = Clip::new(SystemTime::now(), value, format, source);
        info!(
            "Captured {} byte {:?} clip from {source}.",
            clip.value.len(),
            clip.format
        );

        self.history.append(clip.clone());
        self.history.set_selected(clip);
        if let Err(e) = x.become_selection_owner() {
            warn!("Failed to become selection owner after capturing clip: {e}");
        }
    }
}

/// Picks the first advertised target we can store, preferring whatever the
/// owner listed first of PNG and UTF-8 text, with Latin-1 text as the
/// fallback.
fn choose_target(atoms: &Atoms, reply: &GetPropertyReply) -> Atom {
    let Some(targets) = reply.value32() else {
        warn!("Invalid TARGETS property value format.");
        return AtomEnum::STRING.into();
    };

    let mut chosen = None;
    for atom in targets {
        trace!("Available target atom {atom}.");
        if chosen.is_none() && (atom == atoms.image_png || atom == atoms.UTF8_STRING) {
            chosen = Some(atom);
        }
    }
    chosen.unwrap_or_else(|| AtomEnum::STRING.into())
}
