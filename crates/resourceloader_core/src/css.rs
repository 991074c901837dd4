/// A `url(...)` occurrence inside a style sheet.
#[derive(Debug, Clone, PartialEq, Eq)]
struct UrlToken<'a> {
    /// Byte range of the whole `url(...)` token.
    start: usize,
    end: usize,
    quote: Option<char>,
    target: &'a str,
}

/// Rewrite relative `url(...)` references so they resolve from the install
/// root instead of from `dir`, the directory of the style sheet.
pub fn remap(css: &str, dir: &str) -> String {
    let dir = dir.trim_end_matches('/');
    if dir.is_empty() || dir == "." {
        return css.to_string();
    }

    let mut out = String::with_capacity(css.len());
    let mut cursor = 0usize;
    for token in url_tokens(css) {
        if !is_local_reference(token.target) {
            continue;
        }
        out.push_str(&css[cursor..token.start]);
        let remapped = normalize_relative(&format!("{dir}/{}", token.target));
        match token.quote {
            Some(quote) => out.push_str(&format!("url({quote}{remapped}{quote})")),
            None => out.push_str(&format!("url({remapped})")),
        }
        cursor = token.end;
    }
    out.push_str(&css[cursor..]);
    out
}

/// Local files referenced from `css`, query strings stripped, in first
/// occurrence order without duplicates.
pub fn local_file_references(css: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for token in url_tokens(css) {
        if !is_local_reference(token.target) {
            continue;
        }
        let file = token.target.split(['?', '#']).next().unwrap_or("");
        if file.is_empty() {
            continue;
        }
        let file = normalize_relative(file);
        if !out.contains(&file) {
            out.push(file);
        }
    }
    out
}

fn url_tokens(css: &str) -> Vec<UrlToken<'_>> {
    let bytes = css.as_bytes();
    let mut out = Vec::new();
    let mut cursor = 0usize;

    while cursor + 4 <= bytes.len() {
        if !bytes[cursor..cursor + 4].eq_ignore_ascii_case(b"url(") {
            cursor += 1;
            continue;
        }
        let start = cursor;
        let inner_start = cursor + 4;
        let Some(close) = css[inner_start..].find(')') else {
            break;
        };
        let inner_end = inner_start + close;
        let inner = css[inner_start..inner_end].trim();

        let (quote, target) = match inner.chars().next() {
            Some(quote @ ('"' | '\'')) if inner.len() >= 2 && inner.ends_with(quote) => {
                (Some(quote), inner[1..inner.len() - 1].trim())
            }
            _ => (None, inner),
        };
        out.push(UrlToken {
            start,
            end: inner_end + 1,
            quote,
            target,
        });
        cursor = inner_end + 1;
    }

    out
}

fn is_local_reference(target: &str) -> bool {
    !target.is_empty()
        && !target.starts_with('/')
        && !target.starts_with('#')
        && !target.contains(':')
}

/// Collapse `.` and `..` segments of a relative path.
fn normalize_relative(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if matches!(segments.last(), Some(last) if *last != "..") {
                    segments.pop();
                } else {
                    segments.push("..");
                }
            }
            other => segments.push(other),
        }
    }
    segments.join("/")
}

#[cfg(test)]
mod tests {
    use super::{local_file_references, remap};

    #[test]
    fn remap_prefixes_relative_urls_with_sheet_directory() {
        let css = r#".a { background: url(images/a.png); }
.b { background: url( "../shared/b.gif?v=2" ); }
.c { background: URL('c.svg'); }
.d { background: url(http://example.org/d.png); }
.e { background: url(data:image/png;base64,AAAA); }
.f { background: url(/static/f.png); }"#;

        let remapped = remap(css, "skins/vector/");
        assert!(remapped.contains("url(skins/vector/images/a.png)"));
        assert!(remapped.contains(r#"url("skins/shared/b.gif?v=2")"#));
        assert!(remapped.contains("url('skins/vector/c.svg')"));
        assert!(remapped.contains("url(http://example.org/d.png)"));
        assert!(remapped.contains("url(data:image/png;base64,AAAA)"));
        assert!(remapped.contains("url(/static/f.png)"));
    }

    #[test]
    fn remap_without_directory_is_identity() {
        let css = ".a { background: url(a.png); }";
        assert_eq!(remap(css, ""), css);
        assert_eq!(remap(css, "."), css);
    }

    #[test]
    fn references_skip_remote_and_duplicate_urls() {
        let css = r#".a { background: url(skins/vector/a.png?1); }
.b { background: url("skins/vector/a.png"); }
.c { background: url(https://example.org/c.png); }
.d { background: url(skins/./vector/../common/d.png#frag); }
.e { background: url(); }"#;

        assert_eq!(
            local_file_references(css),
            vec![
                "skins/vector/a.png".to_string(),
                "skins/common/d.png".to_string(),
            ]
        );
    }

    #[test]
    fn unterminated_url_is_ignored() {
        assert!(local_file_references(".a { background: url(broken.png").is_empty());
    }
}
