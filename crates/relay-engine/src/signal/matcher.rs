use serde::Serialize;

/// Longest bracket token the normalized scan will consider.
const MAX_TOKEN_CHARS: usize = 100;

/// How a signal was found in model output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    Exact,
    CaseInsensitive,
    Normalized,
}

impl MatchMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchMethod::Exact => "exact",
            MatchMethod::CaseInsensitive => "case_insensitive",
            MatchMethod::Normalized => "normalized",
        }
    }
}

/// Find `signal` in `content`, trying exact, then case-insensitive, then
/// normalized bracket-token comparison.
pub fn match_signal(content: &str, signal: &str) -> Option<MatchMethod> {
    if signal.is_empty() {
        return None;
    }
    if content.contains(signal) {
        return Some(MatchMethod::Exact);
    }
    if content.to_lowercase().contains(&signal.to_lowercase()) {
        return Some(MatchMethod::CaseInsensitive);
    }
    if !is_bracketed(signal) {
        return None;
    }

    let wanted = normalize_signal(signal);
    bracket_tokens(content)
        .any(|token| normalize_signal(token) == wanted)
        .then_some(MatchMethod::Normalized)
}

/// Lowercase, fold diacritics, and collapse whitespace inside a `[...]` token.
/// `"[  KẾT   THÚC ]"` becomes `"[ket thuc]"`.
pub fn normalize_signal(text: &str) -> String {
    let folded: String = text
        .trim()
        .to_lowercase()
        .chars()
        .map(fold_diacritic)
        .collect();

    match folded.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
        Some(inner) => {
            let inner = inner.split_whitespace().collect::<Vec<_>>().join(" ");
            format!("[{inner}]")
        }
        None => folded,
    }
}

/// A signal name must be a `[...]` token with non-blank inner text.
pub fn is_well_formed(name: &str) -> bool {
    is_bracketed(name) && !name[1..name.len() - 1].trim().is_empty()
}

fn is_bracketed(s: &str) -> bool {
    s.len() >= 2 && s.starts_with('[') && s.ends_with(']')
}

/// Every `[...]` span in `content` whose closing bracket is within reach.
fn bracket_tokens(content: &str) -> impl Iterator<Item = &str> {
    content.char_indices().filter(|(_, c)| *c == '[').filter_map(move |(start, _)| {
        content[start + 1..]
            .char_indices()
            .take(MAX_TOKEN_CHARS)
            .find(|(_, c)| *c == ']')
            .map(|(offset, _)| &content[start..start + 1 + offset + 1])
    })
}

fn fold_diacritic(c: char) -> char {
    const TABLE: &[(&str, char)] = &[
        ("àáâãäåāăąảạấầẩẫậắằẳẵặ", 'a'),
        ("çćĉċč", 'c'),
        ("ďđ", 'd'),
        ("èéêëēĕėęěẻẽẹếềểễệ", 'e'),
        ("ìíîïĩīĭįỉị", 'i'),
        ("ñńņňŉ", 'n'),
        ("òóôõöøōŏőỏọốồổỗộơớờởỡợ", 'o'),
        ("śŝşš", 's'),
        ("ţťŧ", 't'),
        ("ùúûüũūŭůűųủụưứừửữự", 'u'),
        ("ýÿŷỳỷỹỵ", 'y'),
        ("źżž", 'z'),
    ];
    if c.is_ascii() {
        return c;
    }
    TABLE
        .iter()
        .find(|(variants, _)| variants.contains(c))
        .map(|(_, base)| *base)
        .unwrap_or(c)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_then_case_insensitive() {
        assert_eq!(match_signal("done [NEXT]", "[NEXT]"), Some(MatchMethod::Exact));
        assert_eq!(match_signal("done [next]", "[NEXT]"), Some(MatchMethod::CaseInsensitive));
        assert_eq!(match_signal("nothing here", "[NEXT]"), None);
    }

    #[test]
    fn normalized_whitespace_and_case() {
        assert_eq!(match_signal("ok [ next ] bye", "[NEXT]"), Some(MatchMethod::Normalized));
        assert_eq!(
            match_signal("Xong. [ kết   thúc ]", "[KẾT THÚC]"),
            Some(MatchMethod::Normalized)
        );
    }

    #[test]
    fn normalized_folds_diacritics() {
        assert_eq!(match_signal("[ket thuc]", "[KẾT THÚC]"), Some(MatchMethod::Normalized));
        assert_eq!(normalize_signal("[  Kết  THÚC thi ]"), "[ket thuc thi]");
    }

    #[test]
    fn unbracketed_signals_skip_normalization() {
        assert_eq!(match_signal("N E X T", "NEXT"), None);
    }

    #[test]
    fn well_formed_names() {
        assert!(is_well_formed("[END]"));
        assert!(!is_well_formed("[ ]"));
        assert!(!is_well_formed("END"));
        assert!(!is_well_formed("["));
    }

    #[test]
    fn scans_multibyte_content() {
        let tokens: Vec<_> = bracket_tokens("ạ [một] b [hai").collect();
        assert_eq!(tokens, vec!["[một]"]);
    }
}
