//! Bootstrap document returned for cached routes
//!
//! The document tells the client which edge node to fetch the asset from and
//! which SHA-256 the fetched bytes must match.

use masternode_common::constants::{
    EDGE_HOST_PLACEHOLDER, EXPECTED_HASH_PLACEHOLDER, ROUTE_PLACEHOLDER,
};
use std::path::Path;

/// Built-in template; the edge node serves content at `{EDGEHOST}/{hash}`
pub const DEFAULT_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<meta name="masternode-edge" content="{EDGEHOST}">
<meta name="masternode-hash" content="{EXPECTEDHASH}">
<meta name="masternode-route" content="{ROUTE}">
<title>Loading</title>
</head>
<body>
<script>
(async function () {
  const meta = (name) => document.querySelector('meta[name="' + name + '"]').content;
  const edge = meta("masternode-edge");
  const expected = meta("masternode-hash");
  const response = await fetch(edge + "/" + expected);
  const body = await response.arrayBuffer();
  const digest = await crypto.subtle.digest("SHA-256", body);
  const actual = Array.from(new Uint8Array(digest))
    .map((b) => b.toString(16).padStart(2, "0"))
    .join("");
  if (actual !== expected) {
    document.body.textContent = "Edge node delivered non matching content for " + meta("masternode-route");
    return;
  }
  document.open();
  document.write(new TextDecoder().decode(body));
  document.close();
})();
</script>
</body>
</html>
"#;

/// Read a custom template, or fall back to the built-in one
pub fn load_template(path: Option<&Path>) -> std::io::Result<String> {
    match path {
        Some(path) => std::fs::read_to_string(path),
        None => Ok(DEFAULT_TEMPLATE.to_string()),
    }
}

/// Substitute the first occurrence of each placeholder with its HTML-escaped
/// value, in a single pass over the template
///
/// Substituted text is never rescanned, so a value that itself contains a
/// placeholder is emitted literally.
pub fn render(template: &str, edge_host: &str, expected_hash: &str, route: &str) -> String {
    let mut pending = [
        (EDGE_HOST_PLACEHOLDER, Some(edge_host)),
        (EXPECTED_HASH_PLACEHOLDER, Some(expected_hash)),
        (ROUTE_PLACEHOLDER, Some(route)),
    ];

    let mut out = String::with_capacity(template.len() + 128);
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        rest = &rest[start..];

        let matched = pending
            .iter_mut()
            .find(|(placeholder, value)| value.is_some() && rest.starts_with(*placeholder));
        match matched {
            Some((placeholder, value)) => {
                if let Some(value) = value.take() {
                    out.push_str(&escape_html(value));
                }
                rest = &rest[placeholder.len()..];
            }
            None => {
                out.push('{');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
