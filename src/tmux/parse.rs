use super::{Session, Window};

/// tmux `-F` format handed to `list-sessions`.
pub const SESSION_FORMAT: &str = "#{session_name}:#{session_windows}:#{session_attached}";

/// tmux `-F` format handed to `list-windows`.
pub const WINDOW_FORMAT: &str = "#{window_index}:#{window_name}:#{window_active}";

/// Parse one `list-sessions` line (`name:window_count:attached`).
///
/// Lines that do not fit the format yield `None`; extra trailing fields are
/// ignored.
pub fn parse_session_line(line: &str) -> Option<Session> {
    if line.is_empty() {
        return None;
    }

    let parts: Vec<&str> = line.split(':').collect();
    if parts.len() < 3 {
        return None;
    }

    let window_count = parts[1].parse().ok()?;
    Some(Session {
        name: parts[0].to_string(),
        window_count,
        attached: parts[2] == "1",
        windows: Vec::new(),
    })
}

/// Parse one `list-windows` line (`index:name:active`).
pub fn parse_window_line(line: &str) -> Option<Window> {
    if line.is_empty() {
        return None;
    }

    let parts: Vec<&str> = line.split(':').collect();
    if parts.len() < 3 {
        return None;
    }

    let index = parts[0].parse().ok()?;
    Some(Window {
        index,
        name: parts[1].to_string(),
        active: parts[2] == "1",
    })
}

/// Parse full `list-sessions` output, skipping malformed lines.
pub fn parse_sessions_output(output: &str) -> Vec<Session> {
    output.lines().filter_map(parse_session_line).collect()
}

/// Parse full `list-windows` output, skipping malformed lines.
pub fn parse_windows_output(output: &str) -> Vec<Window> {
    output.lines().filter_map(parse_window_line).collect()
}
