use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

use memchr::memmem;
use parking_lot::RwLock;
use thiserror::Error;

use crate::format;

/// Two clips captured within this window collapse into one entry when one
/// value is a byte-substring of the other.
const DUPLICATE_WINDOW: Duration = Duration::from_secs(15);

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ClipFormat {
    None,
    String,
    Png,
}

/// One captured piece of clipboard content. The value is immutable once the
/// clip exists; replacing a history entry swaps the whole clip.
#[derive(Clone, Debug)]
pub struct Clip {
    pub created: SystemTime,
    pub value: Arc<[u8]>,
    pub format: ClipFormat,
    pub source: &'static str,
}

impl Clip {
    pub fn new(
        created: SystemTime,
        value: impl Into<Arc<[u8]>>,
        format: ClipFormat,
        source: &'static str,
    ) -> Self {
        Self {
            created,
            value: value.into(),
            format,
            source,
        }
    }

    fn preset(value: &str) -> Self {
        Self::new(
            SystemTime::UNIX_EPOCH,
            value.as_bytes(),
            ClipFormat::String,
            "preset",
        )
    }

    /// Presets carry the zero timestamp as a sentinel.
    pub fn is_preset(&self) -> bool {
        self.created == SystemTime::UNIX_EPOCH
    }

    fn is_duplicate(&self, other: &Clip) -> bool {
        let spacing = match other.created.duration_since(self.created) {
            Ok(duration) => duration,
            Err(e) => e.duration(),
        };
        if spacing > DUPLICATE_WINDOW {
            return false;
        }
        memmem::find(&self.value, &other.value).is_some()
            || memmem::find(&other.value, &self.value).is_some()
    }
}

#[derive(Error, Debug)]
pub enum FindError {
    #[error("empty history")]
    Empty,
    #[error("missing relative time from selection")]
    MissingAgePrefix,
    #[error("no match found")]
    NoMatch,
}

/// A bounded ring of clips, newest last, plus the read-only presets and the
/// cursor naming the clip currently offered to selection requestors.
pub struct History {
    capacity: usize,
    presets: Vec<Clip>,
    state: RwLock<State>,
}

#[derive(Default)]
struct State {
    data: Vec<Clip>,
    first: usize,
    selected: Option<Clip>,
}

impl State {
    fn end_index(&self) -> Option<usize> {
        let len = self.data.len();
        (len > 0).then(|| (self.first + len - 1) % len)
    }

    fn newest_first(&self) -> impl Iterator<Item = &Clip> {
        let len = self.data.len();
        (0..len).map(move |i| &self.data[(self.first + len - 1 - i) % len])
    }
}

impl History {
    pub fn new(capacity: usize, presets: Vec<String>) -> Self {
        Self {
            capacity: capacity.max(1),
            presets: presets.iter().map(|s| Clip::preset(s)).collect(),
            state: RwLock::default(),
        }
    }

    pub fn append(&self, clip: Clip) {
        let mut state = self.state.write();
        if let Some(end) = state.end_index() {
            if state.data[end].is_duplicate(&clip) {
                // Replace the newest entry rather than adding a new record.
                state.data[end] = clip;
                return;
            }
        }
        if state.data.len() < self.capacity {
            state.data.push(clip);
        } else {
            let first = state.first;
            state.data[first] = clip;
            state.first = (first + 1) % self.capacity;
        }
    }

    pub fn top(&self) -> Option<Clip> {
        let state = self.state.read();
        state
            .end_index()
            .map(|end| state.data[end].clone())
            .or_else(|| self.presets.first().cloned())
    }

    /// Snapshots the clip to offer to selection requestors. The clip's bytes
    /// are shared, so a later ring overwrite cannot invalidate the cursor.
    pub fn set_selected(&self, clip: Clip) {
        self.state.write().selected = Some(clip);
    }

    pub fn selected(&self) -> Option<Clip> {
        {
            let state = self.state.read();
            if let Some(clip) = &state.selected {
                return Some(clip.clone());
            }
        }
        self.top()
    }

    /// Applies `f` to every live clip, newest first, with the presets at the
    /// end in their declared order.
    pub fn format(&self, f: impl Fn(&Clip) -> String) -> Vec<String> {
        let state = self.state.read();
        state.newest_first().chain(self.presets.iter()).map(f).collect()
    }

    /// Locates the clip whose formatted line matches `line` once the age
    /// prefix is stripped and surrounding whitespace trimmed.
    pub fn find(&self, line: &str, now: SystemTime) -> Result<Clip, FindError> {
        let state = self.state.read();
        if state.data.is_empty() && self.presets.is_empty() {
            return Err(FindError::Empty);
        }

        let search = format::remove_age_prefix(line).ok_or(FindError::MissingAgePrefix)?;
        let search = trim_line(search);

        for clip in state.newest_first().chain(self.presets.iter()) {
            let formatted = format::line(clip, now);
            let Some(body) = format::remove_age_prefix(&formatted) else {
                continue;
            };
            if trim_line(body) == search {
                return Ok(clip.clone());
            }
        }
        Err(FindError::NoMatch)
    }
}

fn trim_line(s: &str) -> &str {
    s.trim_matches(|c| c == ' ' || c == '\n')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clip_at(created: SystemTime, value: &str) -> Clip {
        Clip::new(created, value.as_bytes(), ClipFormat::String, "test")
    }

    fn values(history: &History) -> Vec<String> {
        history.format(|clip| String::from_utf8_lossy(&clip.value).into_owned())
    }

    #[test]
    fn ring_overwrites_oldest_once_full() {
        let history = History::new(6, Vec::new());
        let base = SystemTime::now();
        let expected = [
            "",
            "0",
            "1 0",
            "2 1 0",
            "3 2 1 0",
            "4 3 2 1 0",
            "5 4 3 2 1 0",
            "6 5 4 3 2 1",
            "7 6 5 4 3 2",
            "8 7 6 5 4 3",
        ];

        for i in 0..9 {
            assert_eq!(values(&history).join(" "), expected[i]);
            // Spaced out past the duplicate window so only ring behavior shows.
            history.append(clip_at(
                base + Duration::from_secs(60 * i as u64),
                &i.to_string(),
            ));
        }
        assert_eq!(values(&history).join(" "), expected[9]);
    }

    #[test]
    fn rapid_duplicates_collapse() {
        let history = History::new(6, Vec::new());
        let now = SystemTime::now();

        history.append(clip_at(now, "Hello"));
        history.append(clip_at(now, "Hell"));
        history.append(clip_at(now, "Hello world"));
        history.append(clip_at(now, "Helo world"));

        assert_eq!(values(&history).join("|"), "Helo world|Hello world");
    }

    #[test]
    fn duplicate_window_expires() {
        let history = History::new(6, Vec::new());
        let base = SystemTime::now();

        history.append(clip_at(base, "Hello"));
        history.append(clip_at(base + Duration::from_secs(16), "Hello world"));

        assert_eq!(values(&history).len(), 2);
    }

    #[test]
    fn presets_always_listed_last() {
        let history = History::new(6, vec!["always".to_owned(), "020 7898 1000".to_owned()]);
        assert_eq!(values(&history), ["always", "020 7898 1000"]);

        let base = SystemTime::now();
        history.append(clip_at(base, "one"));
        history.append(clip_at(base + Duration::from_secs(60), "two"));
        assert_eq!(values(&history), ["two", "one", "always", "020 7898 1000"]);
    }

    #[test]
    fn capacity_excludes_presets() {
        let history = History::new(2, vec!["p".to_owned()]);
        let base = SystemTime::now();

        for i in 0..5 {
            history.append(clip_at(base + Duration::from_secs(60 * i), &i.to_string()));
        }

        assert_eq!(values(&history), ["4", "3", "p"]);
    }

    #[test]
    fn top_falls_back_to_first_preset() {
        let history = History::new(4, vec!["always".to_owned()]);
        assert_eq!(history.top().unwrap().source, "preset");
        assert_eq!(&*history.selected().unwrap().value, b"always");

        history.append(clip_at(SystemTime::now(), "fresh"));
        assert_eq!(&*history.top().unwrap().value, b"fresh");
    }

    #[test]
    fn selected_prefers_cursor_over_top() {
        let history = History::new(4, Vec::new());
        let base = SystemTime::now();
        let one = clip_at(base, "one");

        history.append(one.clone());
        history.append(clip_at(base + Duration::from_secs(60), "two"));
        assert_eq!(&*history.selected().unwrap().value, b"two");

        history.set_selected(one);
        assert_eq!(&*history.selected().unwrap().value, b"one");
    }

    #[test]
    fn find_round_trips_every_entry() {
        let entries = [
            "This is a clip with some text\nand multiple lines. It is probably quite long.",
            "Hello worldHello worldHello worldHello worldHello worldHello world",
            "A\nB\nC\nD\nE\n",
            "ABCD",
            "This is a clip",
            "clip",
            "c",
            "%@&",
        ];

        // Rotate the insertion order to make sure position does not matter.
        for rotation in 0..entries.len() {
            let history = History::new(10, vec!["always".to_owned()]);
            let base = SystemTime::now();
            let mut clips = Vec::new();

            for i in 0..entries.len() {
                // Spaced out to keep the duplicate rule quiet.
                let clip = clip_at(
                    base + Duration::from_secs(3600 * i as u64),
                    entries[(i + rotation) % entries.len()],
                );
                clips.push(clip.clone());
                history.append(clip);
            }

            let now = base + Duration::from_secs(3600 * 24);
            let formatted = history.format(|clip| format::line(clip, now));
            assert_eq!(formatted.len(), entries.len() + 1);

            for (line, clip) in formatted[..entries.len()].iter().zip(clips.iter().rev()) {
                let found = history.find(line, now).unwrap();
                assert_eq!(found.value, clip.value);
            }
            let preset = history.find(&formatted[entries.len()], now).unwrap();
            assert_eq!(&*preset.value, b"always");
        }
    }

    #[test]
    fn find_reports_failures() {
        let history = History::new(4, Vec::new());
        let now = SystemTime::now();
        assert!(matches!(
            history.find("[ 0s ago] x", now),
            Err(FindError::Empty)
        ));

        history.append(clip_at(now, "content"));
        assert!(matches!(
            history.find("no prefix", now),
            Err(FindError::MissingAgePrefix)
        ));
        assert!(matches!(
            history.find("[ 0s ago] missing", now),
            Err(FindError::NoMatch)
        ));
    }
}
