pub const SEPARATOR: char = '/';

/// Appends `name` to `parent` with exactly one separator between them.
pub fn join(parent: &str, name: &str) -> String {
    let parent = parent.trim_end_matches(SEPARATOR);
    let name = name.trim_start_matches(SEPARATOR);
    let mut path = String::with_capacity(parent.len() + name.len() + 1);
    path.push_str(parent);
    path.push(SEPARATOR);
    path.push_str(name);
    path
}

/// `.` and `..`, which must never be recursed into.
pub fn is_pseudo_entry(name: &str) -> bool {
    name == "." || name == ".."
}
