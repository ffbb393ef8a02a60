//! Stylesheet scanning for further resource URLs.
//!
//! Only the references a renderer needs to fetch are reported: `@import`
//! targets, `@font-face` `src` URLs, and `background` / `background-image`
//! URLs of style rules (including rules nested in grouping at-rules such as
//! `@media`). `data:` URIs are skipped. URLs are returned as written; callers
//! resolve them against the stylesheet URL.

use std::collections::HashSet;

use cssparser::{Delimiter, ParseError, Parser, ParserInput, Token};

const BACKGROUND_PROPERTIES: &[&str] = &["background", "background-image"];
const FONT_FACE_PROPERTIES: &[&str] = &["src"];
const GROUPING_RULES: &[&str] = &["media", "supports", "document", "layer", "container"];

/// Collect the fetchable URLs referenced by `css`, in source order, without duplicates.
pub fn discover_urls(css: &str) -> Vec<String> {
    let mut input = ParserInput::new(css);
    let mut parser = Parser::new(&mut input);
    let mut found = Vec::new();
    scan_rule_list(&mut parser, &mut found);

    let mut seen = HashSet::with_capacity(found.len());
    let mut unique = Vec::with_capacity(found.len());
    for url in found {
        let url = url.trim().to_string();
        if url.is_empty() || url.to_ascii_lowercase().starts_with("data:") {
            continue;
        }
        if seen.insert(url.clone()) {
            unique.push(url);
        }
    }
    unique
}

fn scan_rule_list<'i, 't>(parser: &mut Parser<'i, 't>, found: &mut Vec<String>) {
    loop {
        let token = match parser.next() {
            Ok(token) => token.clone(),
            Err(_) => break,
        };
        match token {
            Token::AtKeyword(name) => scan_at_rule(parser, &name.to_ascii_lowercase(), found),
            Token::CurlyBracketBlock => scan_style_block(parser, found),
            _ => scan_qualified_rule(parser, found),
        }
    }
}

fn scan_qualified_rule<'i, 't>(parser: &mut Parser<'i, 't>, found: &mut Vec<String>) {
    loop {
        let token = match parser.next() {
            Ok(token) => token.clone(),
            Err(_) => return,
        };
        if let Token::CurlyBracketBlock = token {
            scan_style_block(parser, found);
            return;
        }
    }
}

fn scan_style_block<'i, 't>(parser: &mut Parser<'i, 't>, found: &mut Vec<String>) {
    let _ = parser.parse_nested_block(|block| {
        scan_declarations(block, BACKGROUND_PROPERTIES, found);
        Ok::<_, ParseError<'i, ()>>(())
    });
}

fn scan_at_rule<'i, 't>(parser: &mut Parser<'i, 't>, name: &str, found: &mut Vec<String>) {
    if name == "import" {
        scan_import(parser, found);
        return;
    }

    loop {
        let token = match parser.next() {
            Ok(token) => token.clone(),
            Err(_) => return,
        };
        match token {
            Token::Semicolon => return,
            Token::CurlyBracketBlock => {
                if name == "font-face" {
                    let _ = parser.parse_nested_block(|block| {
                        scan_declarations(block, FONT_FACE_PROPERTIES, found);
                        Ok::<_, ParseError<'i, ()>>(())
                    });
                } else if GROUPING_RULES.contains(&name) {
                    let _ = parser.parse_nested_block(|block| {
                        scan_rule_list(block, found);
                        Ok::<_, ParseError<'i, ()>>(())
                    });
                }
                return;
            }
            _ => {}
        }
    }
}

fn scan_import<'i, 't>(parser: &mut Parser<'i, 't>, found: &mut Vec<String>) {
    let mut target_seen = false;
    loop {
        let token = match parser.next() {
            Ok(token) => token.clone(),
            Err(_) => return,
        };
        match token {
            Token::Semicolon => return,
            Token::QuotedString(url) | Token::UnquotedUrl(url) if !target_seen => {
                found.push(url.to_string());
                target_seen = true;
            }
            Token::Function(name) if !target_seen && name.eq_ignore_ascii_case("url") => {
                if let Some(url) = url_argument(parser) {
                    found.push(url);
                }
                target_seen = true;
            }
            _ => {}
        }
    }
}

fn scan_declarations<'i, 't>(parser: &mut Parser<'i, 't>, properties: &[&str], found: &mut Vec<String>) {
    loop {
        let token = match parser.next() {
            Ok(token) => token.clone(),
            Err(_) => break,
        };
        match token {
            Token::Semicolon => {}
            Token::Ident(name) => {
                let wanted = properties.iter().any(|p| name.eq_ignore_ascii_case(p));
                let _ = parser.parse_until_after(Delimiter::Semicolon, |value| {
                    if wanted {
                        collect_urls(value, found);
                    } else {
                        while value.next().is_ok() {}
                    }
                    Ok::<_, ParseError<'i, ()>>(())
                });
            }
            _ => {
                let _ = parser.parse_until_after(Delimiter::Semicolon, |rest| {
                    while rest.next().is_ok() {}
                    Ok::<_, ParseError<'i, ()>>(())
                });
            }
        }
    }
}

fn collect_urls<'i, 't>(parser: &mut Parser<'i, 't>, found: &mut Vec<String>) {
    loop {
        let token = match parser.next() {
            Ok(token) => token.clone(),
            Err(_) => break,
        };
        match token {
            Token::UnquotedUrl(url) => found.push(url.to_string()),
            Token::Function(name) if name.eq_ignore_ascii_case("url") => {
                if let Some(url) = url_argument(parser) {
                    found.push(url);
                }
            }
            Token::Function(_)
            | Token::ParenthesisBlock
            | Token::SquareBracketBlock
            | Token::CurlyBracketBlock => {
                let _ = parser.parse_nested_block(|nested| {
                    collect_urls(nested, found);
                    Ok::<_, ParseError<'i, ()>>(())
                });
            }
            _ => {}
        }
    }
}

// `url("...")` with a quoted argument tokenizes as a function block.
fn url_argument<'i, 't>(parser: &mut Parser<'i, 't>) -> Option<String> {
    parser
        .parse_nested_block(|arg| {
            let url = match arg.next() {
                Ok(Token::QuotedString(url)) => Some(url.to_string()),
                _ => None,
            };
            while arg.next().is_ok() {}
            Ok::<_, ParseError<'i, ()>>(url)
        })
        .ok()
        .flatten()
}
