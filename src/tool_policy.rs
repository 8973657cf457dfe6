// ---------------------------------------------------------------------------
// Wildcard pattern matching (simple glob: `*` matches any char sequence)
// ---------------------------------------------------------------------------

/// Match a name against a pattern that may contain `*` wildcards.
/// Examples: `fs_*` matches `fs_read`, `*.example.com` matches `api.example.com`.
pub fn matches_wildcard(pattern: &str, name: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == name;
    }
    let mut remaining = name;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            let Some(rest) = remaining.strip_prefix(part) else {
                return false;
            };
            remaining = rest;
        } else if i == parts.len() - 1 {
            return remaining.ends_with(part);
        } else {
            match remaining.find(part) {
                Some(pos) => remaining = &remaining[pos + part.len()..],
                None => return false,
            }
        }
    }
    true
}

pub fn is_pattern(entry: &str) -> bool {
    entry.contains('*')
}

pub fn any_pattern_matches<S: AsRef<str>>(patterns: &[S], name: &str) -> bool {
    patterns
        .iter()
        .map(|pattern| pattern.as_ref().trim())
        .filter(|pattern| !pattern.is_empty())
        .any(|pattern| matches_wildcard(pattern, name))
}

// ---------------------------------------------------------------------------
// Agent tool lists
// ---------------------------------------------------------------------------

/// Expands an agent's tool entries against the registered names. Exact
/// entries keep their position; a wildcard entry expands to every matching
/// name in sorted order. Duplicates are dropped.
pub fn expand_tool_entries(entries: &[String], available: &[String]) -> Vec<String> {
    let mut sorted = available.to_vec();
    sorted.sort();

    let mut expanded = Vec::<String>::new();
    for entry in entries.iter().map(|entry| entry.trim()) {
        if entry.is_empty() {
            continue;
        }
        if is_pattern(entry) {
            for name in sorted.iter().filter(|name| matches_wildcard(entry, name)) {
                if !expanded.contains(name) {
                    expanded.push(name.clone());
                }
            }
        } else if available.iter().any(|name| name == entry)
            && !expanded.iter().any(|name| name == entry)
        {
            expanded.push(entry.to_string());
        }
    }
    expanded
}

/// Retain only names matching at least one allow pattern. If the allow list
/// is empty, all names pass through. A name matching both allow and deny is
/// denied.
pub fn filter_tool_names_by_policy(
    names: Vec<String>,
    allow_patterns: &[String],
    deny_patterns: &[String],
) -> Vec<String> {
    let has_allow = allow_patterns.iter().any(|p| !p.trim().is_empty());
    names
        .into_iter()
        .filter(|name| {
            let allowed = !has_allow || any_pattern_matches(allow_patterns, name);
            let denied = any_pattern_matches(deny_patterns, name);
            if denied {
                tracing::debug!(tool = %name, "Tool denied by deny_tools policy");
            }
            allowed && !denied
        })
        .collect()
}
