//! URL resolution and DASH template expansion shared by the HLS and DASH
//! parsers (spec §4.1/§4.2).

use url::Url;

/// Resolve `reference` against `base`. Absolute references are returned
/// unchanged; anything else is joined per RFC 3986. Falls back to the raw
/// reference string if `base` itself isn't a parseable URL (best-effort,
/// the parser layer never panics).
pub fn resolve(base: &str, reference: &str) -> String {
    match Url::parse(base) {
        Ok(base_url) => match base_url.join(reference) {
            Ok(joined) => joined.to_string(),
            Err(_) => reference.to_string(),
        },
        Err(_) => reference.to_string(),
    }
}

/// Expand DASH `$Identifier$` and `$Identifier%0Nd$` placeholders in a
/// segment-template string (spec §4.2). Unknown identifiers are left
/// untouched.
pub struct TemplateVars<'a> {
    pub representation_id: &'a str,
    pub number: Option<u64>,
    pub time: Option<u64>,
    pub bandwidth: Option<u64>,
}

pub fn expand_template(template: &str, vars: &TemplateVars) -> String {
    let mut out = String::with_capacity(template.len());
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            if let Some(end) = template[i + 1..].find('$') {
                let token = &template[i + 1..i + 1 + end];
                if token.is_empty() {
                    // "$$" is a literal escaped dollar sign.
                    out.push('$');
                } else if let Some(expanded) = expand_token(token, vars) {
                    out.push_str(&expanded);
                } else {
                    // Unknown token: emit verbatim, including delimiters.
                    out.push('$');
                    out.push_str(token);
                    out.push('$');
                }
                i = i + 1 + end + 1;
                continue;
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

fn expand_token(token: &str, vars: &TemplateVars) -> Option<String> {
    if let Some((name, width)) = parse_width_format(token) {
        let value = numeric_value(name, vars)?;
        return Some(format!("{value:0width$}"));
    }
    match token {
        "RepresentationID" => Some(vars.representation_id.to_string()),
        "Number" => vars.number.map(|n| n.to_string()),
        "Time" => vars.time.map(|t| t.to_string()),
        "Bandwidth" => vars.bandwidth.map(|b| b.to_string()),
        _ => None,
    }
}

/// Parses `Number%05d` into `("Number", 5)`.
fn parse_width_format(token: &str) -> Option<(&str, usize)> {
    let percent = token.find('%')?;
    if !token.ends_with('d') {
        return None;
    }
    let (name, rest) = token.split_at(percent);
    let digits = &rest[1..rest.len() - 1];
    let width: usize = digits.strip_prefix('0')?.parse().ok()?;
    Some((name, width))
}

fn numeric_value(name: &str, vars: &TemplateVars) -> Option<u64> {
    match name {
        "Number" => vars.number,
        "Time" => vars.time,
        "Bandwidth" => vars.bandwidth,
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_relative_against_base() {
        assert_eq!(
            resolve("https://cdn.example.com/streams/master.m3u8", "hi.m3u8"),
            "https://cdn.example.com/streams/hi.m3u8"
        );
    }

    #[test]
    fn expands_number_width_format() {
        let vars = TemplateVars {
            representation_id: "v1",
            number: Some(1),
            time: None,
            bandwidth: None,
        };
        assert_eq!(
            expand_template("v_$RepresentationID$_$Number%05d$.m4s", &vars),
            "v_v1_00001.m4s"
        );
    }

    #[test]
    fn expands_plain_tokens() {
        let vars = TemplateVars {
            representation_id: "v1",
            number: None,
            time: Some(300),
            bandwidth: Some(5_000_000),
        };
        assert_eq!(
            expand_template("seg_$Time$_$Bandwidth$.m4s", &vars),
            "seg_300_5000000.m4s"
        );
    }

    #[test]
    fn leaves_unknown_tokens_verbatim() {
        let vars = TemplateVars {
            representation_id: "v1",
            number: None,
            time: None,
            bandwidth: None,
        };
        assert_eq!(expand_template("$Mystery$.mp4", &vars), "$Mystery$.mp4");
    }
}
