use chrono::DateTime;
use chrono_tz::Tz;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::{Newsletter, Quote};
use crate::prompt::is_market_day;

const ANCHOR_ATTRS: &str = r#"target="_blank" rel="noopener noreferrer""#;
const PLACEHOLDER: char = '\u{1}';

pub fn escape_html(s: &str) -> String {
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

static MD_LINK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[([^\]]+)\]\((https?://[^)\s]+)\)").unwrap());
static BRACKET_URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[(https?://[^\]\s]+)\]").unwrap());
static BARE_URL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"https?://[^\s\x01]+").unwrap());
static BOLD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*\*([^*]+)\*\*").unwrap());
static ITALIC_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*([^*]+)\*").unwrap());
static ORDERED_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+\.\s+").unwrap());

fn anchor(url: &str, text: &str) -> String {
    format!(r#"<a href="{url}" {ANCHOR_ATTRS}>{text}</a>"#)
}

/// Inline pass for one line: escape first, then swap links out for
/// placeholders so emphasis markers never rewrite URL internals, then
/// emphasis, then put the anchors back.
fn render_inline(raw: &str) -> String {
    let escaped = escape_html(raw);

    fn stash(a: String, anchors: &mut Vec<String>) -> String {
        let token = format!("{PLACEHOLDER}{}{PLACEHOLDER}", anchors.len());
        anchors.push(a);
        token
    }
    let mut anchors: Vec<String> = Vec::new();

    let mut text = MD_LINK_RE
        .replace_all(&escaped, |caps: &regex::Captures<'_>| {
            stash(anchor(&caps[2], &caps[1]), &mut anchors)
        })
        .into_owned();
    text = BRACKET_URL_RE
        .replace_all(&text, |caps: &regex::Captures<'_>| {
            stash(anchor(&caps[1], &caps[1]), &mut anchors)
        })
        .into_owned();
    text = BARE_URL_RE
        .replace_all(&text, |caps: &regex::Captures<'_>| {
            stash(anchor(&caps[0], &caps[0]), &mut anchors)
        })
        .into_owned();

    text = BOLD_RE.replace_all(&text, "<strong>$1</strong>").into_owned();
    text = ITALIC_RE.replace_all(&text, "<em>$1</em>").into_owned();

    for (i, a) in anchors.iter().enumerate() {
        text = text.replace(&format!("{PLACEHOLDER}{i}{PLACEHOLDER}"), a);
    }
    text
}

#[derive(PartialEq)]
enum ListState {
    None,
    Unordered,
    Ordered,
}

/// The supported markdown subset, line by line. Anything unrecognized
/// becomes an escaped paragraph.
pub fn markdown_to_html(md: &str) -> String {
    let mut out = String::new();
    let mut list = ListState::None;

    let close_list = |out: &mut String, list: &mut ListState| {
        match list {
            ListState::Unordered => out.push_str("</ul>\n"),
            ListState::Ordered => out.push_str("</ol>\n"),
            ListState::None => {}
        }
        *list = ListState::None;
    };

    for line in md.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            close_list(&mut out, &mut list);
            continue;
        }

        if let Some(rest) = trimmed.strip_prefix("### ") {
            close_list(&mut out, &mut list);
            out.push_str(&format!(
                "<h3 style=\"margin:18px 0 8px;font-size:16px;\">{}</h3>\n",
                render_inline(rest)
            ));
        } else if let Some(rest) = trimmed.strip_prefix("## ") {
            close_list(&mut out, &mut list);
            out.push_str(&format!(
                "<h2 style=\"margin:22px 0 10px;font-size:19px;\">{}</h2>\n",
                render_inline(rest)
            ));
        } else if let Some(rest) = trimmed.strip_prefix("- ").or_else(|| trimmed.strip_prefix("* ")) {
            if list != ListState::Unordered {
                close_list(&mut out, &mut list);
                out.push_str("<ul style=\"margin:8px 0;padding-left:22px;\">\n");
                list = ListState::Unordered;
            }
            out.push_str(&format!("<li style=\"margin:4px 0;\">{}</li>\n", render_inline(rest)));
        } else if let Some(m) = ORDERED_RE.find(trimmed) {
            if list != ListState::Ordered {
                close_list(&mut out, &mut list);
                out.push_str("<ol style=\"margin:8px 0;padding-left:22px;\">\n");
                list = ListState::Ordered;
            }
            out.push_str(&format!(
                "<li style=\"margin:4px 0;\">{}</li>\n",
                render_inline(&trimmed[m.end()..])
            ));
        } else {
            close_list(&mut out, &mut list);
            out.push_str(&format!(
                "<p style=\"margin:10px 0;line-height:1.5;\">{}</p>\n",
                render_inline(trimmed)
            ));
        }
    }
    close_list(&mut out, &mut list);
    out
}

// ----------------------- email template -----------------------

/// `<Name> — <weekday>, <short-month> <day>` in the newsletter's timezone.
pub fn subject_line(name: &str, local_now: &DateTime<Tz>) -> String {
    format!("{name} — {}", local_now.format("%A, %b %-d"))
}

fn quote_row(q: &Quote) -> String {
    let color = if q.change_amount >= 0.0 { "#1a7f37" } else { "#c62828" };
    let cell = "padding:6px 10px;border-bottom:1px solid #e6e6e6;font-size:14px;";
    format!(
        "<tr>\
         <td style=\"{cell}font-weight:600;\">{sym}</td>\
         <td style=\"{cell}text-align:right;\">{price:.2}</td>\
         <td style=\"{cell}text-align:right;color:{color};\">{chg:+.2}</td>\
         <td style=\"{cell}text-align:right;color:{color};\">{pct:+.2}%</td>\
         </tr>\n",
        sym = escape_html(&q.symbol),
        price = q.price,
        chg = q.change_amount,
        pct = q.change_percent,
    )
}

fn market_table(quotes: &[Quote]) -> String {
    if quotes.is_empty() {
        return String::new();
    }
    let head_cell = "padding:6px 10px;border-bottom:2px solid #222;font-size:13px;text-align:right;";
    let mut html = String::from(
        "<table style=\"width:100%;border-collapse:collapse;margin:14px 0;\">\n<tr>",
    );
    html.push_str(&format!("<th style=\"{head_cell}text-align:left;\">Symbol</th>"));
    for col in ["Price", "Change", "%"] {
        html.push_str(&format!("<th style=\"{head_cell}\">{col}</th>"));
    }
    html.push_str("</tr>\n");
    for q in quotes {
        html.push_str(&quote_row(q));
    }
    html.push_str("</table>\n");
    html
}

/// The full digest artifact for one run: HTML body plus the plain-text
/// alternative.
pub struct RenderedDigest {
    pub subject: String,
    pub html: String,
    pub text: String,
}

pub fn render_digest(
    newsletter: &Newsletter,
    local_now: &DateTime<Tz>,
    quotes: &[Quote],
    summary_md: &str,
    symbols: &[String],
) -> RenderedDigest {
    let subject = subject_line(&newsletter.name, local_now);
    let badge = if is_market_day(local_now.date_naive()) {
        "Market Day"
    } else {
        "Market Closed"
    };
    let date_line = local_now.format("%A, %B %-d, %Y").to_string();
    let summary_html = markdown_to_html(summary_md);
    let table = market_table(quotes);

    let footer = if symbols.is_empty() {
        String::new()
    } else {
        format!(
            "<p style=\"margin:6px 0;font-size:12px;color:#777;\">Tracked symbols: {}</p>\n",
            escape_html(&symbols.join(", "))
        )
    };

    let html = format!(
        "<!DOCTYPE html>\n<html><body style=\"margin:0;padding:0;background:#f4f4f4;\">\n\
         <div style=\"max-width:720px;margin:0 auto;padding:24px;background:#ffffff;\
         font-family:Helvetica,Arial,sans-serif;color:#222;\">\n\
         <div style=\"border-bottom:3px solid #222;padding-bottom:12px;margin-bottom:16px;\">\n\
         <h1 style=\"margin:0;font-size:24px;\">{name}</h1>\n\
         <p style=\"margin:4px 0 0;font-size:13px;color:#555;\">{date_line} · \
         <span style=\"font-weight:600;\">{badge}</span></p>\n\
         </div>\n{table}{summary_html}\
         <div style=\"border-top:1px solid #ddd;margin-top:20px;padding-top:10px;\">\n{footer}\
         <p style=\"margin:6px 0;font-size:12px;color:#777;\">Generated by briefcast.</p>\n\
         </div>\n</div>\n</body></html>\n",
        name = escape_html(&newsletter.name),
    );

    let mut text = String::new();
    text.push_str(&format!("{}\n{date_line} · {badge}\n\n", newsletter.name));
    for q in quotes {
        text.push_str(&format!(
            "- {} {:.2} ({:+.2}, {:+.2}%)\n",
            q.symbol, q.price, q.change_amount, q.change_percent
        ));
    }
    if !quotes.is_empty() {
        text.push('\n');
    }
    text.push_str(&html_to_text(&summary_html));
    if !symbols.is_empty() {
        text.push_str(&format!("\nTracked symbols: {}\n", symbols.join(", ")));
    }

    RenderedDigest { subject, html, text }
}

static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").unwrap());

/// Tag-stripping text projection of rendered HTML; list items become
/// bullets and entities are decoded.
pub fn html_to_text(html: &str) -> String {
    let bulleted = html
        .replace("<li style=\"margin:4px 0;\">", "- ")
        .replace("</p>", "\n")
        .replace("</li>", "\n")
        .replace("</h2>", "\n")
        .replace("</h3>", "\n")
        .replace("</tr>", "\n");
    let stripped = TAG_RE.replace_all(&bulleted, "");
    let decoded = stripped
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'");
    let mut out = String::new();
    for line in decoded.lines() {
        let line = line.trim_end();
        if line.trim().is_empty() {
            if !out.ends_with("\n\n") && !out.is_empty() {
                out.push('\n');
            }
        } else {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewsletterType, Verbosity};
    use chrono::TimeZone;

    #[test]
    fn headings_lists_and_paragraphs() {
        let md = "## SECTION 1 - MARKET PERFORMANCE\n\nCalm day.\n\n\
                  - first\n- second\n\n1. one\n2. two\n\n### LOOKING AHEAD (Tomorrow)";
        let html = markdown_to_html(md);
        assert!(html.contains("<h2 style=\"margin:22px 0 10px;font-size:19px;\">SECTION 1 - MARKET PERFORMANCE</h2>"));
        assert!(html.contains("<h3"));
        assert!(html.contains("<ul"));
        assert!(html.contains("<ol"));
        assert_eq!(html.matches("<li").count(), 4);
        assert!(html.contains("<p style=\"margin:10px 0;line-height:1.5;\">Calm day.</p>"));
        // Lists are closed.
        assert!(html.contains("</ul>"));
        assert!(html.contains("</ol>"));
    }

    #[test]
    fn emphasis_and_links() {
        let html = markdown_to_html("**bold** and *lean* with [story](https://e.com/a?x=1&y=2)");
        assert!(html.contains("<strong>bold</strong>"));
        assert!(html.contains("<em>lean</em>"));
        assert!(html.contains(r#"<a href="https://e.com/a?x=1&amp;y=2" target="_blank" rel="noopener noreferrer">story</a>"#));
    }

    #[test]
    fn bracketed_and_bare_urls_become_anchors() {
        let html = markdown_to_html("see [https://e.com/a] or https://e.com/b now");
        assert_eq!(html.matches("<a href=").count(), 2);
        assert!(html.contains(r#"<a href="https://e.com/b""#));
        assert!(html.matches(ANCHOR_ATTRS).count() == 2);
    }

    #[test]
    fn raw_html_is_escaped_not_rendered() {
        let html = markdown_to_html("<script>alert('x')</script> & co");
        assert!(!html.contains("<script>"));
        assert!(html.contains("&lt;script&gt;"));
        assert!(html.contains("&amp; co"));
    }

    #[test]
    fn emphasis_never_rewrites_url_internals() {
        // Underscore-free but asterisk-adjacent URL text must survive.
        let html = markdown_to_html("[a*b](https://e.com/x*y) *it*");
        assert!(html.contains(r#"href="https://e.com/x*y""#));
        assert!(html.contains("<em>it</em>"));
    }

    fn fixture_newsletter() -> Newsletter {
        Newsletter {
            id: 1,
            slug: "daily".into(),
            name: "Daily & Brief".into(),
            timezone: "America/New_York".into(),
            schedule_times: vec![],
            active: true,
            include_watchlist: true,
            newsletter_type: NewsletterType::Markets,
            verbosity: Verbosity::Medium,
            custom_prompt: String::new(),
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn subject_line_format() {
        let tz: Tz = "America/New_York".parse().unwrap();
        let now = tz.with_ymd_and_hms(2026, 7, 31, 7, 0, 0).unwrap();
        assert_eq!(subject_line("Daily Brief", &now), "Daily Brief — Friday, Jul 31");
    }

    #[test]
    fn digest_has_badge_table_and_footer() {
        let tz: Tz = "America/New_York".parse().unwrap();
        let now = tz.with_ymd_and_hms(2026, 7, 31, 7, 0, 0).unwrap();
        let quotes = vec![
            Quote { symbol: "SPY".into(), price: 612.0, change_amount: 1.5, change_percent: 0.25 },
            Quote { symbol: "QQQ".into(), price: 555.0, change_amount: -3.0, change_percent: -0.54 },
        ];
        let d = render_digest(
            &fixture_newsletter(),
            &now,
            &quotes,
            "## SECTION 1 - MARKET PERFORMANCE\n\n- steady",
            &["SPY".into(), "QQQ".into()],
        );
        assert!(d.html.contains("Daily &amp; Brief"));
        assert!(d.html.contains("Market Day"));
        assert!(d.html.contains("#1a7f37")); // gain green
        assert!(d.html.contains("#c62828")); // loss red
        assert!(d.html.contains("max-width:720px"));
        assert!(!d.html.contains("<style"));
        assert!(d.html.contains("Tracked symbols: SPY, QQQ"));
        // Weekend badge.
        let sat = tz.with_ymd_and_hms(2026, 8, 1, 7, 0, 0).unwrap();
        let d2 = render_digest(&fixture_newsletter(), &sat, &[], "x", &[]);
        assert!(d2.html.contains("Market Closed"));
    }

    #[test]
    fn plain_text_alternative_bulletizes() {
        let tz: Tz = "America/New_York".parse().unwrap();
        let now = tz.with_ymd_and_hms(2026, 7, 31, 7, 0, 0).unwrap();
        let quotes = vec![Quote {
            symbol: "SPY".into(),
            price: 612.0,
            change_amount: 1.5,
            change_percent: 0.25,
        }];
        let d = render_digest(&fixture_newsletter(), &now, &quotes, "- a story & more", &[]);
        assert!(d.text.contains("- SPY 612.00 (+1.50, +0.25%)"));
        assert!(d.text.contains("- a story & more"));
        assert!(!d.text.contains('<'));
    }
}
