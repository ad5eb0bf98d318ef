//! Hostlist grammar: bracketed numeric ranges in the pdsh style.
//!
//! `foo-cmm[1-2]` expands to `foo-cmm1, foo-cmm2`; groups may hold comma
//! lists (`nid[001-003,005]`), zero padding is taken from the range's left
//! operand, and a term may carry multiple groups (`r[1-2]c[1-2]`).

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HostlistError {
    #[error("unbalanced bracket in '{0}'")]
    UnbalancedBracket(String),

    #[error("bad range '{0}'")]
    BadRange(String),

    #[error("empty hostlist term")]
    EmptyTerm,
}

/// Expand one hostlist string into concrete host names.
pub fn expand(list: &str) -> Result<Vec<String>, HostlistError> {
    let mut out = Vec::new();
    for term in split_top_level(list)? {
        if term.is_empty() {
            return Err(HostlistError::EmptyTerm);
        }
        out.extend(expand_term(&term)?);
    }
    Ok(out)
}

/// Split on commas outside brackets.
fn split_top_level(list: &str) -> Result<Vec<String>, HostlistError> {
    let mut terms = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    for c in list.chars() {
        match c {
            '[' => {
                depth += 1;
                current.push(c);
            }
            ']' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| HostlistError::UnbalancedBracket(list.to_string()))?;
                current.push(c);
            }
            ',' if depth == 0 => {
                terms.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c),
        }
    }
    if depth != 0 {
        return Err(HostlistError::UnbalancedBracket(list.to_string()));
    }
    terms.push(current.trim().to_string());
    Ok(terms)
}

fn expand_term(term: &str) -> Result<Vec<String>, HostlistError> {
    let Some(open) = term.find('[') else {
        return Ok(vec![term.to_string()]);
    };
    let close = term[open..]
        .find(']')
        .map(|i| open + i)
        .ok_or_else(|| HostlistError::UnbalancedBracket(term.to_string()))?;

    let prefix = &term[..open];
    let group = &term[open + 1..close];
    let rest = &term[close + 1..];

    if group.contains('[') {
        return Err(HostlistError::UnbalancedBracket(term.to_string()));
    }

    let mut items = Vec::new();
    for item in group.split(',') {
        expand_group_item(item.trim(), &mut items)?;
    }
    if items.is_empty() {
        return Err(HostlistError::BadRange(group.to_string()));
    }

    let suffixes = expand_term(rest)?;
    let mut out = Vec::with_capacity(items.len() * suffixes.len());
    for item in &items {
        for suffix in &suffixes {
            out.push(format!("{prefix}{item}{suffix}"));
        }
    }
    Ok(out)
}

fn expand_group_item(item: &str, out: &mut Vec<String>) -> Result<(), HostlistError> {
    if item.is_empty() {
        return Err(HostlistError::BadRange(item.to_string()));
    }
    let Some((lo_raw, hi_raw)) = item.split_once('-') else {
        out.push(item.to_string());
        return Ok(());
    };

    let lo: u64 = lo_raw
        .parse()
        .map_err(|_| HostlistError::BadRange(item.to_string()))?;
    let hi: u64 = hi_raw
        .parse()
        .map_err(|_| HostlistError::BadRange(item.to_string()))?;
    if hi < lo {
        return Err(HostlistError::BadRange(item.to_string()));
    }

    // Zero padding follows the left operand's width.
    let width = if lo_raw.starts_with('0') && lo_raw.len() > 1 {
        lo_raw.len()
    } else {
        0
    };
    for n in lo..=hi {
        out.push(format!("{n:0width$}"));
    }
    Ok(())
}
