use crate::models::{ListingRecord, RawListingRow};
use chrono::NaiveDate;
use scraper::{Html, Selector};
use tracing::warn;

// ── Text ──────────────────────────────────────────────────────────────────────

/// Collapse runs of whitespace and trim. Empty / placeholder values → None.
pub fn clean_text(s: &str) -> Option<String> {
    let s = s.split_whitespace().collect::<Vec<_>>().join(" ");
    if s.is_empty() || s == "N/A" || s == "-" || s == "—" {
        return None;
    }
    Some(s)
}

/// Visible text of an HTML fragment. Plain strings pass through unchanged.
/// `<span class="badge">Open</span>` → "Open"
pub fn strip_html(fragment: &str) -> Option<String> {
    if !fragment.contains('<') && !fragment.contains('&') {
        return clean_text(fragment);
    }
    let doc = Html::parse_fragment(fragment);
    let text: String = doc.root_element().text().collect::<Vec<_>>().join(" ");
    clean_text(&text)
}

/// First `href` inside an HTML fragment.
pub fn first_href(fragment: &str) -> Option<String> {
    let doc = Html::parse_fragment(fragment);
    let sel = Selector::parse("a[href]").ok()?;
    doc.select(&sel)
        .next()
        .and_then(|a| a.value().attr("href"))
        .and_then(clean_text)
}

/// Uppercase alphanumeric words joined with `_`.
/// " Himalayan  Hydro Ltd. " → "HIMALAYAN_HYDRO_LTD"
pub fn slug(s: &str) -> String {
    s.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_uppercase())
        .collect::<Vec<_>>()
        .join("_")
}

// ── Values ────────────────────────────────────────────────────────────────────

/// Parse price: skip any currency prefix, then digits with separators.
/// "NPR 1,234.56" → 1234.56 | "Rs. 100" → 100.0 | "100" → 100.0
pub fn parse_price(s: &str) -> Option<f64> {
    let s = s.trim();
    let start = s.find(|c: char| c.is_ascii_digit())?;
    let cleaned: String = s[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .filter(|c| *c != ',')
        .collect();
    let price: f64 = cleaned.trim_end_matches('.').parse().ok()?;
    if price > 0.0 { Some(price) } else { None }
}

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%Y.%m.%d",
    "%d-%m-%Y",
    "%d/%m/%Y",
    "%b %d, %Y",
    "%B %d, %Y",
    "%d %b %Y",
    "%d %B %Y",
    "%Y-%m-%d %H:%M:%S",
];

/// Parse dates in any of the formats the calendar has used.
/// Falls back to the first token that parses, so "2024-01-01 (Mon)" works.
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Some(d);
        }
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Some(dt.date_naive());
    }

    s.split_whitespace()
        .map(|tok| tok.trim_matches(|c: char| c == ',' || c == '(' || c == ')'))
        .find_map(|tok| NaiveDate::parse_from_str(tok, "%Y-%m-%d").ok())
}

// ── Identifier ────────────────────────────────────────────────────────────────

/// Stable dedup key for a listing.
///
/// `<COMPANY>-<earliest date>` when any date is known, otherwise every
/// distinguishing field: `<COMPANY>-<TYPE>[-<SYMBOL>][-<PRICE>]`.
pub fn listing_identifier(
    company_name: &str,
    share_type: &str,
    symbol: Option<&str>,
    opening_date: Option<NaiveDate>,
    closing_date: Option<NaiveDate>,
    price: Option<f64>,
) -> String {
    let company = slug(company_name);

    let earliest = match (opening_date, closing_date) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    };
    if let Some(date) = earliest {
        return format!("{}-{}", company, date.format("%Y-%m-%d"));
    }

    let mut parts = vec![company, slug(share_type)];
    if let Some(sym) = symbol.map(slug).filter(|s| !s.is_empty()) {
        parts.push(sym);
    }
    if let Some(p) = price {
        parts.push(format!("{:.2}", p));
    }
    parts.join("-")
}

// ── Raw row → ListingRecord ───────────────────────────────────────────────────

pub fn raw_row_to_listing(row: RawListingRow, default_share_type: &str) -> Option<ListingRecord> {
    let Some(company_name) = row.company_name.as_deref().and_then(clean_text) else {
        warn!(
            "Dropping entry without company name (symbol={:?}, opening={:?})",
            row.symbol, row.opening_date
        );
        return None;
    };

    let symbol = row.symbol.as_deref().and_then(clean_text);
    let share_type = row
        .share_type
        .as_deref()
        .and_then(clean_text)
        .unwrap_or_else(|| default_share_type.to_string());
    let opening_date = row.opening_date.as_deref().and_then(parse_date);
    let closing_date = row.closing_date.as_deref().and_then(parse_date);
    let price_per_unit = row.price.as_deref().and_then(parse_price);

    if opening_date.is_none() && row.opening_date.as_deref().and_then(clean_text).is_some() {
        warn!("{}: unparsable opening date {:?}", company_name, row.opening_date);
    }
    if closing_date.is_none() && row.closing_date.as_deref().and_then(clean_text).is_some() {
        warn!("{}: unparsable closing date {:?}", company_name, row.closing_date);
    }

    let identifier = listing_identifier(
        &company_name,
        &share_type,
        symbol.as_deref(),
        opening_date,
        closing_date,
        price_per_unit,
    );

    let mut raw_fields = row.extra;
    if let Some(p) = row.price.as_deref().and_then(clean_text) {
        raw_fields.insert("price".to_string(), p);
    }

    Some(ListingRecord {
        identifier,
        company_name,
        symbol,
        share_type,
        opening_date,
        closing_date,
        price_per_unit,
        url: row.url.as_deref().and_then(clean_text),
        raw_fields,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_parse_price() {
        assert_eq!(parse_price("NPR 1,234.56"), Some(1234.56));
        assert_eq!(parse_price("Rs. 100"), Some(100.0));
        assert_eq!(parse_price("100"), Some(100.0));
        assert_eq!(parse_price("-"), None);
        assert_eq!(parse_price(""), None);
    }

    #[test]
    fn test_parse_date_formats() {
        assert_eq!(parse_date("2024-01-01"), Some(ymd(2024, 1, 1)));
        assert_eq!(parse_date(" Feb 20, 2024 "), Some(ymd(2024, 2, 20)));
        assert_eq!(parse_date("20 Feb 2024"), Some(ymd(2024, 2, 20)));
        assert_eq!(parse_date("2024-03-05 (Tue)"), Some(ymd(2024, 3, 5)));
        assert_eq!(parse_date("Coming soon"), None);
        assert_eq!(parse_date(""), None);
    }

    #[test]
    fn test_strip_html() {
        assert_eq!(
            strip_html("<span class=\"badge\">\n  Open  </span>").as_deref(),
            Some("Open")
        );
        assert_eq!(strip_html("Plain &amp; simple").as_deref(), Some("Plain & simple"));
        assert_eq!(strip_html("<b></b>"), None);
        assert_eq!(
            first_href("<a class=\"btn\" href=\"/ipo/abc\">View</a>").as_deref(),
            Some("/ipo/abc")
        );
    }

    #[test]
    fn test_identifier_uses_earliest_date() {
        let id = listing_identifier(
            "ABC",
            "IPO",
            Some("ABC"),
            Some(ymd(2024, 1, 5)),
            Some(ymd(2024, 1, 1)),
            Some(100.0),
        );
        assert_eq!(id, "ABC-2024-01-01");
    }

    #[test]
    fn test_identifier_ignores_formatting_noise() {
        let a = listing_identifier("Himalayan Hydro Ltd.", "IPO", None, Some(ymd(2024, 2, 1)), None, None);
        let b = listing_identifier("  himalayan   hydro ltd ", "IPO", None, Some(ymd(2024, 2, 1)), None, None);
        assert_eq!(a, b);
        assert_eq!(a, "HIMALAYAN_HYDRO_LTD-2024-02-01");
    }

    #[test]
    fn test_identifier_without_dates() {
        let id = listing_identifier("Xyz Bank", "Right Share", Some("xyzb"), None, None, Some(100.0));
        assert_eq!(id, "XYZ_BANK-RIGHT_SHARE-XYZB-100.00");
    }

    #[test]
    fn test_row_without_company_is_dropped() {
        let row = RawListingRow {
            symbol: Some("ABC".into()),
            opening_date: Some("2024-01-01".into()),
            ..Default::default()
        };
        assert!(raw_row_to_listing(row, "IPO").is_none());
    }

    #[test]
    fn test_row_with_bad_date_keeps_none() {
        let row = RawListingRow {
            company_name: Some("ABC Ltd".into()),
            opening_date: Some("TBA".into()),
            price: Some("Rs. 100".into()),
            ..Default::default()
        };
        let rec = raw_row_to_listing(row, "IPO").unwrap();
        assert_eq!(rec.opening_date, None);
        assert_eq!(rec.closing_date, None);
        assert_eq!(rec.share_type, "IPO");
        assert_eq!(rec.price_per_unit, Some(100.0));
        assert_eq!(rec.field("price"), Some("Rs. 100"));
        assert_eq!(rec.identifier, "ABC_LTD-IPO-100.00");
    }
}
