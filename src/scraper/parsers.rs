use crate::error::ParseError;
use crate::models::{RawContent, RawListingRow};
use scraper::{ElementRef, Html, Selector};
use serde_json::{Map, Value};

use super::cleaner::{clean_text, first_href, strip_html};

/// Parse either content shape into raw rows, source order preserved.
pub fn parse_raw_rows(content: &RawContent) -> Result<Vec<RawListingRow>, ParseError> {
    match content {
        RawContent::Json(body) => parse_json_rows(body),
        RawContent::Markup(html) => parse_markup_rows(html),
    }
}

// ── JSON (DataTables server-side payload) ─────────────────────────────────────

pub fn parse_json_rows(body: &str) -> Result<Vec<RawListingRow>, ParseError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| ParseError::SchemaMismatch(format!("invalid JSON: {}", e)))?;

    let items = match &value {
        Value::Object(obj) => match obj.get("data") {
            Some(Value::Array(items)) => items,
            Some(other) => {
                return Err(ParseError::SchemaMismatch(format!(
                    "`data` is {} instead of an array",
                    json_kind(other)
                )));
            }
            None => {
                let keys: Vec<&str> = obj.keys().map(|k| k.as_str()).take(8).collect();
                return Err(ParseError::SchemaMismatch(format!(
                    "object without `data` (keys: {:?})",
                    keys
                )));
            }
        },
        Value::Array(items) => items,
        other => {
            return Err(ParseError::SchemaMismatch(format!(
                "top-level {} is neither an object nor an array",
                json_kind(other)
            )));
        }
    };

    items
        .iter()
        .enumerate()
        .map(|(i, item)| match item {
            Value::Object(obj) => Ok(json_object_to_row(obj)),
            other => Err(ParseError::SchemaMismatch(format!(
                "entry {} is {} instead of an object",
                i,
                json_kind(other)
            ))),
        })
        .collect()
}

// Accepted keys per field, most specific first. The first one present wins.
const COMPANY_KEYS: &[&str] = &["company_name", "company", "name"];
const SYMBOL_KEYS: &[&str] = &["symbol"];
const SHARE_TYPE_KEYS: &[&str] = &["share_type", "type"];
const OPENING_KEYS: &[&str] = &["opening_date", "open_date"];
const CLOSING_KEYS: &[&str] = &["closing_date", "close_date"];
const PRICE_KEYS: &[&str] = &["price_per_unit", "price"];

fn json_object_to_row(obj: &Map<String, Value>) -> RawListingRow {
    let mut used: Vec<&str> = vec!["url", "view"];
    let mut field = |keys: &[&'static str]| -> Option<String> {
        let (key, raw) = keys
            .iter()
            .find_map(|k| obj.get(*k).and_then(json_scalar).map(|raw| (*k, raw)))?;
        used.push(key);
        strip_html(&raw)
    };

    let mut row = RawListingRow {
        company_name: field(COMPANY_KEYS),
        symbol: field(SYMBOL_KEYS),
        share_type: field(SHARE_TYPE_KEYS),
        opening_date: field(OPENING_KEYS),
        closing_date: field(CLOSING_KEYS),
        price: field(PRICE_KEYS),
        ..Default::default()
    };

    // An explicit `url` beats the link inside the `view` button.
    row.url = obj
        .get("url")
        .and_then(json_scalar)
        .and_then(|u| clean_text(&u))
        .or_else(|| obj.get("view").and_then(json_scalar).and_then(|v| first_href(&v)));

    // Losing aliases are kept as extras rather than dropped.
    for (key, value) in obj {
        if used.contains(&key.as_str()) {
            continue;
        }
        if let Some(text) = json_scalar(value).and_then(|raw| strip_html(&raw)) {
            row.extra.insert(key.clone(), text);
        }
    }

    row
}

fn json_scalar(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ── Markup (rendered calendar page) ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Column {
    Company,
    Symbol,
    ShareType,
    Opening,
    Closing,
    Price,
    View,
    Other,
}

fn classify_header(h: &str) -> Column {
    let h = h.to_lowercase();
    if h.contains("company") || h == "name" {
        Column::Company
    } else if h.contains("symbol") || h == "script" {
        Column::Symbol
    } else if h.contains("type") {
        Column::ShareType
    } else if h.contains("open") {
        Column::Opening
    } else if h.contains("clos") {
        Column::Closing
    } else if h.contains("price") {
        Column::Price
    } else if h.contains("view") || h.contains("detail") {
        Column::View
    } else {
        Column::Other
    }
}

fn header_key(h: &str) -> String {
    h.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join("_")
}

fn selector(s: &str) -> Result<Selector, ParseError> {
    Selector::parse(s).map_err(|e| ParseError::SchemaMismatch(format!("selector {}: {:?}", s, e)))
}

fn cell_text(el: &ElementRef<'_>) -> Option<String> {
    clean_text(&el.text().collect::<Vec<_>>().join(" "))
}

pub fn parse_markup_rows(html: &str) -> Result<Vec<RawListingRow>, ParseError> {
    let doc = Html::parse_document(html);

    let table_sel = selector("table")?;
    let th_sel = selector("thead th")?;
    let first_row_th_sel = selector("tr th")?;
    let tr_sel = selector("tbody tr")?;
    let td_sel = selector("td")?;
    let a_sel = selector("a[href]")?;

    for table in doc.select(&table_sel) {
        let mut headers: Vec<String> = table
            .select(&th_sel)
            .map(|th| cell_text(&th).unwrap_or_default())
            .collect();
        if headers.is_empty() {
            headers = table
                .select(&first_row_th_sel)
                .map(|th| cell_text(&th).unwrap_or_default())
                .collect();
        }

        let columns: Vec<Column> = headers.iter().map(|h| classify_header(h)).collect();
        if !columns.contains(&Column::Company) {
            continue;
        }

        let mut rows = Vec::new();
        for tr in table.select(&tr_sel) {
            let cells: Vec<ElementRef<'_>> = tr.select(&td_sel).collect();

            // "No data available in table" placeholder rows span every column.
            if cells.len() < 2 {
                continue;
            }

            let mut row = RawListingRow::default();
            for (idx, cell) in cells.iter().enumerate() {
                let column = columns.get(idx).copied().unwrap_or(Column::Other);
                let text = cell_text(cell);
                let href = cell
                    .select(&a_sel)
                    .next()
                    .and_then(|a| a.value().attr("href"))
                    .and_then(clean_text);

                match column {
                    Column::Company => row.company_name = text,
                    Column::Symbol => row.symbol = text,
                    Column::ShareType => row.share_type = text,
                    Column::Opening => row.opening_date = text,
                    Column::Closing => row.closing_date = text,
                    Column::Price => row.price = text,
                    Column::View => {
                        if href.is_some() {
                            row.url = href.clone();
                        }
                    }
                    Column::Other => {
                        if let (Some(h), Some(t)) = (headers.get(idx), text) {
                            let key = header_key(h);
                            if !key.is_empty() {
                                row.extra.insert(key, t);
                            }
                        }
                    }
                }

                if row.url.is_none() && column != Column::View {
                    if let Some(href) = href {
                        row.url = Some(href);
                    }
                }
            }

            rows.push(row);
        }

        return Ok(rows);
    }

    Err(ParseError::SchemaMismatch(
        "no table with a company column found in page".to_string(),
    ))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
