//! Minimal extraction helpers for the container listing documents returned by
//! the Azure Blob service.
//!
//! Only plain `<Tag>text</Tag>` elements are understood. Self-closing tags
//! (`<NextMarker />`) read as absent.

/// Every `<tag>…</tag>` body in document order
pub(crate) fn blocks<'a>(xml: &'a str, tag: &str) -> Vec<&'a str> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let mut found = Vec::new();
    let mut rest = xml;

    while let Some(start) = rest.find(&open) {
        rest = &rest[start + open.len()..];
        match rest.find(&close) {
            Some(end) => {
                found.push(&rest[..end]);
                rest = &rest[end + close.len()..];
            }
            None => break,
        }
    }
    found
}

/// Unescaped text of the first `<tag>` element, if any
pub(crate) fn first_text(xml: &str, tag: &str) -> Option<String> {
    blocks(xml, tag).first().map(|text| unescape(text))
}

/// Unescaped text of `<child>` within each `<parent>` block
pub(crate) fn child_texts(xml: &str, parent: &str, child: &str) -> Vec<String> {
    blocks(xml, parent)
        .into_iter()
        .filter_map(|block| first_text(block, child))
        .collect()
}

/// Resolve the predefined XML entities and numeric character references
pub(crate) fn unescape(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];
        let Some(semi) = rest.find(';') else {
            break;
        };
        let entity = &rest[1..semi];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ => entity
                .strip_prefix("#x")
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                .and_then(char::from_u32),
        };
        match decoded {
            Some(c) => {
                out.push(c);
                rest = &rest[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}
