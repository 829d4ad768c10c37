use scraper::{ElementRef, Selector};

use crate::AdapterError;

pub(crate) fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(format!("invalid selector {css}: {e}")))
}

pub(crate) fn text_of(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

pub(crate) fn first_text(element: ElementRef<'_>, css: &Selector) -> Option<String> {
    element
        .select(css)
        .next()
        .map(text_of)
        .filter(|t| !t.is_empty())
}

pub(crate) fn first_attr(element: ElementRef<'_>, css: &Selector, attr: &str) -> Option<String> {
    element
        .select(css)
        .next()
        .and_then(|n| n.value().attr(attr))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
