use std::{
    iter,
    time::{Duration, SystemTime},
};

use crate::history::{Clip, ClipFormat};

pub const LINE_LEN: usize = 60;

/// Renders one clip as a fixed-width menu line: a bracketed relative age,
/// the first line of the content padded to fill the row, and a `[+K lines]`
/// marker when more lines follow. The result is always `LINE_LEN` bytes.
pub fn line(clip: &Clip, now: SystemTime) -> String {
    let age = if clip.is_preset() {
        " preset".to_owned()
    } else {
        relative_age(now.duration_since(clip.created).unwrap_or_default())
    };
    let prefix = format!("[{age}] ");

    let (mut body, suffix) = match clip.format {
        ClipFormat::Png => (
            format!("{{png image {:.1}kB}}", clip.value.len() as f32 / 1024.0),
            String::new(),
        ),
        ClipFormat::String | ClipFormat::None => {
            let text = String::from_utf8_lossy(&clip.value);
            let extra_lines = text.matches('\n').count();
            let body = text
                .split('\n')
                .next()
                .unwrap_or("")
                .trim_matches(|c| c == ' ' || c == '\n' || c == '\t')
                .to_owned();
            let suffix = if extra_lines > 0 {
                format!(" [+{extra_lines} lines]")
            } else {
                String::new()
            };
            (body, suffix)
        }
    };

    let width = LINE_LEN.saturating_sub(prefix.len() + suffix.len());
    if body.len() > width {
        // Truncation is byte-based, backed off to a character boundary so a
        // multi-byte sequence is never split.
        body.truncate(floor_char_boundary(&body, width.saturating_sub(3)));
        body.push_str("...");
    }

    let mut line = String::with_capacity(LINE_LEN);
    line.push_str(&prefix);
    line.push_str(&body);
    line.extend(iter::repeat(' ').take(width.saturating_sub(body.len())));
    line.push_str(&suffix);
    line
}

/// Returns the part of a formatted line after its `[...]` age prefix, or
/// `None` when the line carries no prefix.
pub fn remove_age_prefix(line: &str) -> Option<&str> {
    line.find(']').map(|i| &line[i + 1..])
}

fn relative_age(elapsed: Duration) -> String {
    const MINUTE: f64 = 60.;
    const HOUR: f64 = 60. * MINUTE;
    const DAY: f64 = 24. * HOUR;

    let seconds = elapsed.as_secs_f64();
    if seconds < 120. {
        format!("{:>2}s ago", seconds.round() as u64)
    } else if seconds < 120. * MINUTE {
        format!("{:>2}m ago", (seconds / MINUTE).round() as u64)
    } else if seconds < 120. * HOUR {
        format!("{:>2}h ago", (seconds / HOUR).round() as u64)
    } else {
        format!("{:>2}d ago", (seconds / DAY).round() as u64)
    }
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    while !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}
