//! Checkbox-list parsing and targeted checkbox rewrites.

use std::sync::LazyLock;

use regex::Regex;

use super::{Group, Task, TaskId, TaskStatus};

static GROUP_ANNOTATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\[\s*group\s*:\s*(\d{1,9})\s*\]").expect("group annotation pattern")
});

/// Byte offset of the checkbox state character within `line`, or `None` when
/// the line is not a checkbox entry (`- [ ] text`, `* [x] text`, `+ [X] text`).
pub(crate) fn checkbox_offset(line: &str) -> Option<usize> {
    let indent = line.len() - line.trim_start().len();
    let rest = &line[indent..];
    let mut chars = rest.char_indices();

    let (_, bullet) = chars.next()?;
    if !matches!(bullet, '-' | '*' | '+') {
        return None;
    }

    let mut open = None;
    let mut saw_space = false;
    for (i, c) in chars.by_ref() {
        if c == ' ' || c == '\t' {
            saw_space = true;
            continue;
        }
        if c == '[' && saw_space {
            open = Some(i);
        }
        break;
    }
    let open = open?;

    let state_at = open + 1;
    let state = rest[state_at..].chars().next()?;
    if !matches!(state, ' ' | 'x' | 'X') {
        return None;
    }
    let after = &rest[state_at + 1..];
    let after = after.strip_prefix(']')?;
    match after.chars().next() {
        None => {}
        Some(c) if c.is_whitespace() => {}
        Some(_) => return None,
    }
    Some(indent + state_at)
}

fn entry_text(line: &str, offset: usize) -> &str {
    // Skip the state char and the closing bracket.
    line[offset + 2..].trim()
}

pub(crate) fn split_group(text: &str) -> (Group, String) {
    let group = GROUP_ANNOTATION
        .captures(text)
        .and_then(|cap| cap.get(1))
        .and_then(|m| m.as_str().parse::<u32>().ok())
        .map(Group::Explicit)
        .unwrap_or(Group::Default);
    let stripped = GROUP_ANNOTATION.replace_all(text, " ");
    let description = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    (group, description)
}

/// Parse every checkbox entry in document order. Ids are 1-based ordinals.
pub fn parse_document(text: &str) -> Vec<Task> {
    let mut tasks = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let Some(offset) = checkbox_offset(line) else {
            continue;
        };
        let status = match line[offset..].chars().next() {
            Some(' ') => TaskStatus::Pending,
            _ => TaskStatus::Completed,
        };
        let (group, description) = split_group(entry_text(line, offset));
        tasks.push(Task {
            id: TaskId(tasks.len() + 1),
            description,
            group,
            status,
            line: idx + 1,
        });
    }
    tasks
}

/// Rewrite the checkbox state of the given entries, leaving every other byte
/// untouched. Returns the new text and how many entries actually changed.
pub fn set_status(
    text: &str,
    ids: &[TaskId],
    status: TaskStatus,
) -> Result<(String, usize), TaskId> {
    let mark = match status {
        TaskStatus::Pending => ' ',
        TaskStatus::Completed => 'x',
    };

    let mut out = String::with_capacity(text.len());
    let mut ordinal = 0usize;
    let mut found = 0usize;
    let mut changed = 0usize;

    for line in text.split_inclusive('\n') {
        let Some(offset) = checkbox_offset(line) else {
            out.push_str(line);
            continue;
        };
        ordinal += 1;
        if !ids.contains(&TaskId(ordinal)) {
            out.push_str(line);
            continue;
        }
        found += 1;
        let current = line[offset..].chars().next().unwrap_or(' ');
        let already = matches!(
            (current, status),
            (' ', TaskStatus::Pending) | ('x' | 'X', TaskStatus::Completed)
        );
        if already {
            out.push_str(line);
            continue;
        }
        out.push_str(&line[..offset]);
        out.push(mark);
        out.push_str(&line[offset + 1..]);
        changed += 1;
    }

    if found < ids.len() {
        let missing = ids
            .iter()
            .copied()
            .find(|id| id.0 == 0 || id.0 > ordinal)
            .unwrap_or(ids[0]);
        return Err(missing);
    }
    Ok((out, changed))
}
