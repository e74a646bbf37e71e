//! Note type definition and a small Anki template renderer.
//!
//! The renderer covers the subset of Anki's template language the note type
//! uses, plus what a previewer needs for arbitrary decks: `{{Field}}`,
//! `{{FrontSide}}`, `{{#Field}}...{{/Field}}`, `{{^Field}}...{{/Field}}` and
//! the `text:` filter. Other filters pass the value through unchanged.

use std::collections::HashMap;

pub const MODEL_NAME: &str = "CN Sentence (Putonghua)";

/// Field order of every note.
pub const FIELD_NAMES: [&str; 13] = [
    "Hanzi",
    "Pinyin",
    "Indo",
    "Literal",
    "LiteralBr",
    "Grammar",
    "Audio",
    "AudioMarkup",
    "Enable_RM",
    "Enable_LT",
    "Enable_MP",
    "Tags",
    "UID",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardTemplate {
    pub name: &'static str,
    pub front: &'static str,
    pub back: &'static str,
}

/// One card per template, in this order, for every note.
pub const TEMPLATES: [CardTemplate; 3] = [
    CardTemplate {
        name: "Card 1 - Reading→Meaning",
        front: r#"<div class="hanzi">{{Hanzi}}</div>"#,
        back: r#"{{FrontSide}}<hr><div class="pinyin">{{Pinyin}}</div><div class="indo"><em>{{Indo}}</em></div><div class="literal">{{LiteralBr}}</div><div class="grammar">{{Grammar}}</div><div class="audio">{{AudioMarkup}}</div>"#,
    },
    CardTemplate {
        name: "Card 2 - Listening→Text",
        front: r#"<div class="audio">{{AudioMarkup}}</div>"#,
        back: r#"{{FrontSide}}<hr><div class="hanzi">{{Hanzi}}</div><div class="pinyin">{{Pinyin}}</div><div class="indo">{{Indo}}</div>"#,
    },
    CardTemplate {
        name: "Card 3 - Meaning→Production",
        front: r#"<div class="indo">{{Indo}}</div><div class="hint">Hint: {{Grammar}}</div>"#,
        back: r#"{{FrontSide}}<hr><div class="hanzi">{{Hanzi}}</div><div class="pinyin">{{Pinyin}}</div><div class="audio">{{AudioMarkup}}</div>"#,
    },
];

pub const CSS: &str = "\
.card { font-family: system-ui, 'Noto Sans CJK SC', 'PingFang SC', sans-serif; background:#0b0b0e; color:#eaeaf0; }
hr { border: 0; border-top: 1px solid #2a2a34; }
.hanzi { font-size: 32px; line-height: 1.35; margin: 10px 0; }
.pinyin { margin: 6px 0; color:#c9d1d9; }
.indo { margin: 4px 0; color:#a9b1bb; }
.literal { margin-top: 8px; line-height: 1.4; color:#b7c2cc; }
.grammar { margin-top: 10px; opacity: 0.9; color:#9aa3ad; }
.hint { margin: 6px 0; color:#9aa3ad; }
.audio { margin-top: 10px; }
";

/// Break a literal gloss at each comma or semicolon (ASCII or full-width).
///
/// Empty segments are dropped, so runs of separators give a single break and
/// no break is left at either end.
pub fn literal_to_br(literal: &str) -> String {
    literal
        .split(['，', ',', '；', ';'])
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("<br>")
}

/// Render `template` against `fields`.
///
/// `front_side` replaces `{{FrontSide}}`; pass `None` when rendering a front.
pub fn render(template: &str, fields: &HashMap<&str, &str>, front_side: Option<&str>) -> String {
    let mut out = String::with_capacity(template.len());
    render_into(&mut out, template, fields, front_side);
    out
}

fn render_into(out: &mut String, template: &str, fields: &HashMap<&str, &str>, front: Option<&str>) {
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let Some(close) = after.find("}}") else {
            out.push_str(&rest[open..]);
            return;
        };
        let tag = after[..close].trim();
        rest = &after[close + 2..];

        if let Some(section) = tag.strip_prefix('#').or_else(|| tag.strip_prefix('^')) {
            let name = section.trim();
            let (body, remaining) = split_section(rest, name);
            let filled = fields.get(name).is_some_and(|v| !v.trim().is_empty());
            if filled == tag.starts_with('#') {
                render_into(out, body, fields, front);
            }
            rest = remaining;
        } else if !tag.starts_with('/') {
            out.push_str(&substitute(tag, fields, front));
        }
    }
    out.push_str(rest);
}

/// Body of the section opened just before `text`, and the text after its
/// closing tag. An unclosed section runs to the end.
fn split_section<'a>(text: &'a str, name: &str) -> (&'a str, &'a str) {
    let opens = [format!("{{{{#{name}}}}}"), format!("{{{{^{name}}}}}")];
    let close = format!("{{{{/{name}}}}}");

    let mut depth = 1;
    let mut pos = 0;
    while let Some(next_close) = text[pos..].find(&close).map(|i| pos + i) {
        let next_open = opens
            .iter()
            .filter_map(|o| text[pos..next_close].find(o.as_str()).map(|i| (pos + i, o.len())))
            .min();
        match next_open {
            Some((at, len)) => {
                depth += 1;
                pos = at + len;
            }
            None => {
                depth -= 1;
                if depth == 0 {
                    return (&text[..next_close], &text[next_close + close.len()..]);
                }
                pos = next_close + close.len();
            }
        }
    }
    (text, "")
}

fn substitute(tag: &str, fields: &HashMap<&str, &str>, front: Option<&str>) -> String {
    if tag == "FrontSide" {
        return front.unwrap_or_default().to_string();
    }
    match tag.split_once(':') {
        Some((filter, name)) => {
            let value = fields.get(name.trim()).copied().unwrap_or_default();
            match filter.trim() {
                "text" => strip_html(value),
                _ => value.to_string(),
            }
        }
        None => fields.get(tag).copied().unwrap_or_default().to_string(),
    }
}

/// Remove markup, keeping text content.
pub fn strip_html(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields<'a>(pairs: &[(&'a str, &'a str)]) -> HashMap<&'a str, &'a str> {
        pairs.iter().copied().collect()
    }

    #[test]
    fn literal_separators_become_single_breaks() {
        assert_eq!(literal_to_br("saya , makan；；nasi;"), "saya<br>makan<br>nasi");
        assert_eq!(literal_to_br(" ，, "), "");
        assert_eq!(literal_to_br("tanpa pemisah"), "tanpa pemisah");
    }

    #[test]
    fn back_includes_front_side() {
        let f = fields(&[("Hanzi", "你好"), ("Pinyin", "nǐ hǎo")]);
        let front = render("<b>{{Hanzi}}</b>", &f, None);
        let back = render("{{FrontSide}}<hr>{{Pinyin}}", &f, Some(&front));
        assert_eq!(back, "<b>你好</b><hr>nǐ hǎo");
    }

    #[test]
    fn sections_follow_field_emptiness() {
        let f = fields(&[("Grammar", "把 + O"), ("Literal", " ")]);
        let tpl = "{{#Grammar}}G:{{Grammar}}{{/Grammar}}{{^Literal}}no literal{{/Literal}}{{#Literal}}L{{/Literal}}";
        assert_eq!(render(tpl, &f, None), "G:把 + Ono literal");
    }

    #[test]
    fn nested_sections_with_same_name() {
        let f = fields(&[("A", "x")]);
        let tpl = "{{#A}}1{{#A}}2{{/A}}3{{/A}}4";
        assert_eq!(render(tpl, &f, None), "1234");
        let empty = fields(&[]);
        assert_eq!(render(tpl, &empty, None), "4");
    }

    #[test]
    fn text_filter_strips_markup_and_unknown_fields_are_empty() {
        let f = fields(&[("Indo", "<em>halo</em> dunia")]);
        assert_eq!(render("{{text:Indo}}|{{Missing}}|{{furigana:Indo}}", &f, None), "halo dunia||<em>halo</em> dunia");
    }

    #[test]
    fn templates_only_reference_known_fields() {
        for template in TEMPLATES {
            for side in [template.front, template.back] {
                let mut rest = side;
                while let Some(open) = rest.find("{{") {
                    let close = rest[open..].find("}}").unwrap() + open;
                    let name = &rest[open + 2..close];
                    assert!(name == "FrontSide" || FIELD_NAMES.contains(&name), "{name}");
                    rest = &rest[close + 2..];
                }
            }
        }
    }
}
