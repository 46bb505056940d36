use crate::models::ListingRecord;
use crate::utils::fmt_amount;

/// Legacy Telegram Markdown treats these as entity delimiters.
pub fn escape_markdown(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '_' | '*' | '`' | '[') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Renders a listing into the alert text.
#[derive(Debug, Clone)]
pub struct MessageFormatter {
    currency: String,
}

impl MessageFormatter {
    pub fn new(currency: impl Into<String>) -> Self {
        Self { currency: currency.into() }
    }

    pub fn format(&self, listing: &ListingRecord) -> String {
        let mut lines = vec![
            format!("🚨 *NEW {} ALERT* 🚨", escape_markdown(&listing.share_type.to_uppercase())),
            String::new(),
        ];

        let mut line = |label: &str, value: Option<String>| {
            if let Some(v) = value {
                lines.push(format!("*{}:* {}", label, escape_markdown(&v)));
            }
        };

        line("Symbol", listing.symbol.clone());
        line("Company", Some(listing.company_name.clone()));
        line("Units", listing.field("units").map(str::to_string));
        line(
            "Price",
            listing
                .price_per_unit
                .map(|p| format!("{} {}", self.currency, fmt_amount(p)))
                .or_else(|| listing.field("price").map(str::to_string)),
        );
        line("Opening Date", listing.opening_date.map(|d| d.format("%Y-%m-%d").to_string()));
        line("Closing Date", listing.closing_date.map(|d| d.format("%Y-%m-%d").to_string()));
        line("Issue Manager", listing.field("issue_manager").map(str::to_string));
        line("Status", listing.field("status").map(str::to_string));

        if let Some(url) = &listing.url {
            lines.push(String::new());
            lines.push(format!("[View Details]({})", url));
        }

        lines.join("\n")
    }
}
