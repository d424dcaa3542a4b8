//! Mapping of Store API payloads into the REST v3 shapes clients expect.
//!
//! The Store API is public and lighter, but its schema differs: prices are
//! integer strings in minor units, stock is a boolean, images carry extra
//! fields. Fallback bodies go through here before they are cached or served
//! so callers only ever see one schema.

use serde_json::{json, Map, Value};

/// Entity kinds the fallback source can serve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizeKind {
    Product,
    Category,
    Attribute,
}

/// Normalize a Store API payload, element-wise for lists
pub fn normalize(kind: NormalizeKind, payload: Value) -> Value {
    match payload {
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| normalize_one(kind, item))
                .collect(),
        ),
        other => normalize_one(kind, other),
    }
}

fn normalize_one(kind: NormalizeKind, item: Value) -> Value {
    match item {
        Value::Object(fields) => match kind {
            NormalizeKind::Product => product(&fields),
            NormalizeKind::Category => category(&fields),
            NormalizeKind::Attribute => attribute(&fields),
        },
        other => other,
    }
}

fn field<'a>(fields: &'a Map<String, Value>, name: &str) -> &'a Value {
    fields.get(name).unwrap_or(&Value::Null)
}

fn string_field(fields: &Map<String, Value>, name: &str) -> Value {
    match fields.get(name) {
        Some(Value::String(s)) => Value::String(s.clone()),
        Some(Value::Number(n)) => Value::String(n.to_string()),
        _ => Value::String(String::new()),
    }
}

fn product(fields: &Map<String, Value>) -> Value {
    let prices = fields.get("prices").and_then(Value::as_object);
    let minor_unit = prices
        .and_then(|p| p.get("currency_minor_unit"))
        .and_then(Value::as_u64)
        .unwrap_or(2) as u32;
    let price = |name: &str| -> Value {
        let raw = prices
            .and_then(|p| p.get(name))
            .and_then(Value::as_str)
            .unwrap_or("");
        Value::String(minor_to_decimal(raw, minor_unit))
    };

    let in_stock = fields
        .get("is_in_stock")
        .and_then(Value::as_bool)
        .unwrap_or(true);
    let stock_status = if in_stock { "instock" } else { "outofstock" };

    let images: Vec<Value> = field(fields, "images")
        .as_array()
        .map(|images| {
            images
                .iter()
                .map(|image| {
                    json!({
                        "id": image.get("id").cloned().unwrap_or(Value::Null),
                        "src": image.get("src").cloned().unwrap_or_else(|| json!("")),
                        "alt": image.get("alt").cloned().unwrap_or_else(|| json!("")),
                        "name": image.get("name").cloned().unwrap_or_else(|| json!("")),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let categories: Vec<Value> = field(fields, "categories")
        .as_array()
        .map(|categories| {
            categories
                .iter()
                .map(|c| {
                    json!({
                        "id": c.get("id").cloned().unwrap_or(Value::Null),
                        "name": c.get("name").cloned().unwrap_or_else(|| json!("")),
                        "slug": c.get("slug").cloned().unwrap_or_else(|| json!("")),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    json!({
        "id": field(fields, "id").clone(),
        "name": string_field(fields, "name"),
        "slug": string_field(fields, "slug"),
        "permalink": string_field(fields, "permalink"),
        "type": fields.get("type").cloned().unwrap_or_else(|| json!("simple")),
        "description": string_field(fields, "description"),
        "short_description": string_field(fields, "short_description"),
        "sku": string_field(fields, "sku"),
        "price": price("price"),
        "regular_price": price("regular_price"),
        "sale_price": price("sale_price"),
        "on_sale": fields.get("on_sale").and_then(Value::as_bool).unwrap_or(false),
        "stock_status": stock_status,
        "images": images,
        "categories": categories,
        "average_rating": string_field(fields, "average_rating"),
        "rating_count": fields.get("review_count").cloned().unwrap_or_else(|| json!(0)),
    })
}

fn category(fields: &Map<String, Value>) -> Value {
    json!({
        "id": field(fields, "id").clone(),
        "name": string_field(fields, "name"),
        "slug": string_field(fields, "slug"),
        "parent": fields.get("parent").cloned().unwrap_or_else(|| json!(0)),
        "description": string_field(fields, "description"),
        "count": fields.get("count").cloned().unwrap_or_else(|| json!(0)),
    })
}

fn attribute(fields: &Map<String, Value>) -> Value {
    let slug = match fields.get("taxonomy").or_else(|| fields.get("slug")) {
        Some(Value::String(s)) => s.clone(),
        _ => String::new(),
    };
    json!({
        "id": field(fields, "id").clone(),
        "name": string_field(fields, "name"),
        "slug": slug,
        "type": fields.get("type").cloned().unwrap_or_else(|| json!("select")),
        "order_by": fields
            .get("order")
            .or_else(|| fields.get("order_by"))
            .cloned()
            .unwrap_or_else(|| json!("menu_order")),
        "has_archives": fields.get("has_archives").and_then(Value::as_bool).unwrap_or(false),
    })
}

/// Convert an integer amount in minor units to a decimal string
///
/// `("1999", 2)` becomes `"19.99"`; an empty amount stays empty.
pub fn minor_to_decimal(raw: &str, minor_unit: u32) -> String {
    let raw = raw.trim();
    if raw.is_empty() || minor_unit == 0 {
        return raw.to_string();
    }

    let (negative, digits) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw),
    };
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return raw.to_string();
    }

    let unit = minor_unit as usize;
    let padded = format!("{:0>width$}", digits, width = unit + 1);
    let (whole, fraction) = padded.split_at(padded.len() - unit);
    format!("{}{}.{}", if negative { "-" } else { "" }, whole, fraction)
}
