//! Per-document-type field schemas and schema-checked coercion.
//!
//! A schema is a static list of [`FieldSpec`]s. The field extractor renders
//! it into the prompt with [`Schema::prompt_listing`] and feeds the model's
//! JSON object back through [`Schema::build_fields`], which validates every
//! field against its declared [`FieldKind`]. Values that do not fit the kind
//! become "not found" instead of being stored as raw model text.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::models::{DocumentType, ExtractedField};
use crate::value::{
    parse_bool, parse_date, parse_money, parse_number, parse_percentage, to_minor_units,
    FieldValue,
};

#[derive(Debug, Clone, Copy)]
pub enum FieldKind {
    Text,
    Money,
    Date,
    Percentage,
    Number { unit: Option<&'static str> },
    Boolean,
    List(&'static FieldKind),
    Group(&'static [FieldSpec]),
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub kind: FieldKind,
}

const fn field(name: &'static str, kind: FieldKind, description: &'static str) -> FieldSpec {
    FieldSpec {
        name,
        description,
        kind,
    }
}

const SQM: FieldKind = FieldKind::Number { unit: Some("m²") };

const PARTY: &[FieldSpec] = &[
    field("name", FieldKind::Text, "full name of the person or company"),
    field("role", FieldKind::Text, "landlord or tenant"),
    field("address", FieldKind::Text, "postal address"),
];

const LEASE_TERM: &[FieldSpec] = &[
    field("start", FieldKind::Date, "lease start date"),
    field("end", FieldKind::Date, "lease end date if fixed-term"),
    field("fixed_term", FieldKind::Boolean, "true if the lease is fixed-term"),
    field("duration", FieldKind::Text, "stated duration, e.g. \"5 Jahre\""),
];

const LEASE: &[FieldSpec] = &[
    field("parties", FieldKind::List(&FieldKind::Group(PARTY)), "landlord(s) and tenant(s)"),
    field(
        "property_description",
        FieldKind::Text,
        "address and kind of the leased property (flat, office, retail, storage)",
    ),
    field("monthly_rent", FieldKind::Money, "monthly net rent (Kaltmiete / Nettomiete)"),
    field(
        "utility_costs",
        FieldKind::Money,
        "monthly advance payment for service charges (Nebenkosten)",
    ),
    field("total_rent", FieldKind::Money, "monthly gross rent (Warmmiete / Bruttomiete)"),
    field("term", FieldKind::Group(LEASE_TERM), "lease term"),
    field(
        "notice_period",
        FieldKind::Number {
            unit: Some("months"),
        },
        "notice period in months",
    ),
    field("deposit", FieldKind::Money, "security deposit (Kaution)"),
    field("living_area", SQM, "rented area in square meters"),
    field("rent_indexation", FieldKind::Text, "index or graduated rent clause, if any"),
    field(
        "special_agreements",
        FieldKind::List(&FieldKind::Text),
        "special agreements (Sondervereinbarungen)",
    ),
];

const AREAS: &[FieldSpec] = &[
    field("living_area", SQM, "living area in square meters"),
    field("plot_area", SQM, "plot area in square meters"),
];

const APPRAISAL: &[FieldSpec] = &[
    field("market_value", FieldKind::Money, "market value (Verkehrswert)"),
    field("income_value", FieldKind::Money, "income value (Ertragswert), if stated"),
    field("asset_value", FieldKind::Money, "asset value (Sachwert), if stated"),
    field(
        "capitalization_rate",
        FieldKind::Percentage,
        "property yield rate (Liegenschaftszinssatz) used for the income value",
    ),
    field("appraiser_name", FieldKind::Text, "name of the appraiser (Gutachter)"),
    field(
        "construction_year",
        FieldKind::Number { unit: None },
        "year of construction",
    ),
    field("area_measurements", FieldKind::Group(AREAS), "area measurements"),
    field("valuation_date", FieldKind::Date, "valuation reference date (Bewertungsstichtag)"),
    field("usage_type", FieldKind::Text, "usage, e.g. residential, commercial, mixed"),
    field("property_address", FieldKind::Text, "address of the appraised property"),
];

const ENCUMBRANCE: &[FieldSpec] = &[
    field("kind", FieldKind::Text, "e.g. Grundschuld, Hypothek, Dienstbarkeit, Wegerecht"),
    field("amount", FieldKind::Money, "secured amount, if any"),
    field("creditor", FieldKind::Text, "creditor or beneficiary"),
    field("description", FieldKind::Text, "further details"),
];

const LAND_REGISTRY: &[FieldSpec] = &[
    field("owners", FieldKind::List(&FieldKind::Text), "registered owner names"),
    field(
        "encumbrances",
        FieldKind::List(&FieldKind::Group(ENCUMBRANCE)),
        "charges and easements (Abteilung II and III)",
    ),
    field("parcel_number", FieldKind::Text, "parcel number(s) (Flurstück / Flurnummer)"),
    field("parcel_size", SQM, "parcel size in square meters"),
    field("land_registry_office", FieldKind::Text, "land registry office (Grundbuchamt)"),
    field("sheet_number", FieldKind::Text, "register sheet number (Blatt)"),
    field("cadastral_district", FieldKind::Text, "cadastral district (Gemarkung)"),
    field("as_of_date", FieldKind::Date, "date the extract was issued"),
];

const BILLING_PERIOD: &[FieldSpec] = &[
    field("from", FieldKind::Date, "first day of the billing period"),
    field("to", FieldKind::Date, "last day of the billing period"),
];

const LINE_ITEM: &[FieldSpec] = &[
    field("label", FieldKind::Text, "cost item, e.g. Heizkosten, Wasser, Müllabfuhr"),
    field("amount", FieldKind::Money, "tenant's share"),
    field("allocation_key", FieldKind::Text, "allocation key, e.g. per m², per person, usage"),
];

const UTILITY_STATEMENT: &[FieldSpec] = &[
    field("billing_period", FieldKind::Group(BILLING_PERIOD), "billing period"),
    field(
        "line_items",
        FieldKind::List(&FieldKind::Group(LINE_ITEM)),
        "individual cost items",
    ),
    field(
        "allocation_key",
        FieldKind::Text,
        "predominant allocation key of the statement",
    ),
    field(
        "balance",
        FieldKind::Money,
        "amount due from the tenant (Nachzahlung); negative for a refund (Guthaben)",
    ),
    field("total_costs", FieldKind::Money, "total service charges for the period"),
    field("advance_payments", FieldKind::Money, "advance payments already made"),
    field("tenant", FieldKind::Text, "tenant name"),
    field("property_address", FieldKind::Text, "address of the property"),
];

const GENERIC: &[FieldSpec] = &[
    field("title", FieldKind::Text, "document title or subject"),
    field("parties", FieldKind::List(&FieldKind::Text), "people or companies named"),
    field("key_dates", FieldKind::List(&FieldKind::Date), "important dates"),
    field("amounts", FieldKind::List(&FieldKind::Money), "important monetary amounts"),
];

/// Field layout of one [`DocumentType`].
#[derive(Debug, Clone, Copy)]
pub struct Schema {
    pub document_type: DocumentType,
    pub fields: &'static [FieldSpec],
}

static SCHEMAS: [Schema; 5] = [
    Schema {
        document_type: DocumentType::Lease,
        fields: LEASE,
    },
    Schema {
        document_type: DocumentType::Appraisal,
        fields: APPRAISAL,
    },
    Schema {
        document_type: DocumentType::LandRegistryExtract,
        fields: LAND_REGISTRY,
    },
    Schema {
        document_type: DocumentType::UtilityStatement,
        fields: UTILITY_STATEMENT,
    },
    Schema {
        document_type: DocumentType::Unknown,
        fields: GENERIC,
    },
];

pub fn schema_for(document_type: DocumentType) -> &'static Schema {
    match document_type {
        DocumentType::Lease => &SCHEMAS[0],
        DocumentType::Appraisal => &SCHEMAS[1],
        DocumentType::LandRegistryExtract => &SCHEMAS[2],
        DocumentType::UtilityStatement => &SCHEMAS[3],
        DocumentType::Unknown => &SCHEMAS[4],
    }
}

impl Schema {
    pub fn field_names(&self) -> Vec<&'static str> {
        self.fields.iter().map(|f| f.name).collect()
    }

    /// Render the schema as an indented bullet list for the extraction prompt.
    pub fn prompt_listing(&self) -> String {
        let mut out = String::new();
        render_specs(self.fields, 0, &mut out);
        out
    }

    /// Validate a model response object against this schema.
    ///
    /// Returns one entry per schema field, in schema order. Missing,
    /// empty, or ill-typed values are `None`.
    pub fn build_fields(&self, object: &Map<String, Value>, currency: &str) -> Vec<ExtractedField> {
        self.fields
            .iter()
            .map(|spec| ExtractedField {
                name: spec.name.to_string(),
                value: lookup(object, spec.name)
                    .and_then(|v| coerce(&spec.kind, v, currency))
                    .filter(|v| !v.is_empty()),
            })
            .collect()
    }
}

/// Filled share of `fields`, in `[0, 1]`.
pub fn fill_ratio(fields: &[ExtractedField]) -> f32 {
    if fields.is_empty() {
        return 0.0;
    }
    let filled = fields.iter().filter(|f| f.value.is_some()).count();
    filled as f32 / fields.len() as f32
}

fn kind_hint(kind: &FieldKind) -> String {
    match kind {
        FieldKind::Text => "string".to_string(),
        FieldKind::Money => "amount as string with currency, e.g. \"1.200,00 EUR\"; keep ranges like \"1500-1600 EUR\"".to_string(),
        FieldKind::Date => "date YYYY-MM-DD".to_string(),
        FieldKind::Percentage => "percentage as number".to_string(),
        FieldKind::Number { unit: Some(u) } => format!("number in {u}"),
        FieldKind::Number { unit: None } => "number".to_string(),
        FieldKind::Boolean => "true or false".to_string(),
        FieldKind::List(inner) => match inner {
            FieldKind::Group(_) => "list of objects".to_string(),
            other => format!("list of {}", kind_hint(other)),
        },
        FieldKind::Group(_) => "object".to_string(),
    }
}

fn render_specs(specs: &[FieldSpec], depth: usize, out: &mut String) {
    let indent = "  ".repeat(depth);
    for spec in specs {
        out.push_str(&format!(
            "{indent}- {} ({}): {}\n",
            spec.name,
            kind_hint(&spec.kind),
            spec.description
        ));
        match spec.kind {
            FieldKind::Group(children) => render_specs(children, depth + 1, out),
            FieldKind::List(FieldKind::Group(children)) => render_specs(children, depth + 1, out),
            _ => {}
        }
    }
}

fn normalize_key(k: &str) -> String {
    k.chars()
        .filter(|c| !matches!(c, '_' | '-' | ' '))
        .flat_map(char::to_lowercase)
        .collect()
}

fn lookup<'a>(object: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    if let Some(v) = object.get(name) {
        return Some(v);
    }
    let wanted = normalize_key(name);
    object
        .iter()
        .find(|(k, _)| normalize_key(k) == wanted)
        .map(|(_, v)| v)
}

/// Coerce one JSON value into `kind`, or `None` if it does not fit.
pub fn coerce(kind: &FieldKind, value: &Value, currency: &str) -> Option<FieldValue> {
    if value.is_null() {
        return None;
    }
    match kind {
        FieldKind::Text => match value {
            Value::String(s) => {
                let s = s.trim();
                (!s.is_empty()).then(|| FieldValue::text(s))
            }
            Value::Number(n) => Some(FieldValue::text(n.to_string())),
            Value::Bool(b) => Some(FieldValue::text(b.to_string())),
            Value::Array(items) => {
                let parts: Vec<&str> = items.iter().filter_map(Value::as_str).collect();
                (!parts.is_empty()).then(|| FieldValue::text(parts.join(", ")))
            }
            _ => None,
        },
        FieldKind::Money => match value {
            Value::Number(n) => n
                .as_f64()
                .and_then(to_minor_units)
                .map(|m| FieldValue::money(m, currency)),
            Value::String(s) => parse_money(s, currency),
            Value::Object(obj) => {
                let cur = lookup(obj, "currency")
                    .and_then(Value::as_str)
                    .unwrap_or(currency);
                ["amount", "value", "betrag"]
                    .iter()
                    .find_map(|k| lookup(obj, k))
                    .and_then(|v| coerce(&FieldKind::Money, v, cur))
            }
            _ => None,
        },
        FieldKind::Date => value
            .as_str()
            .and_then(parse_date)
            .map(|d| FieldValue::Date { value: d }),
        FieldKind::Percentage => match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => parse_percentage(s),
            _ => None,
        }
        .map(|v| FieldValue::Percentage { value: v }),
        FieldKind::Number { unit } => match value {
            Value::Number(n) => n.as_f64().map(|v| FieldValue::Number {
                value: v,
                unit: unit.map(str::to_string),
            }),
            Value::String(s) => parse_number(s, *unit),
            _ => None,
        },
        FieldKind::Boolean => match value {
            Value::Bool(b) => Some(*b),
            Value::String(s) => parse_bool(s),
            Value::Number(n) => n.as_i64().and_then(|i| match i {
                0 => Some(false),
                1 => Some(true),
                _ => None,
            }),
            _ => None,
        }
        .map(|b| FieldValue::Boolean { value: b }),
        FieldKind::List(inner) => {
            let items: Vec<FieldValue> = match value {
                Value::Array(items) => items
                    .iter()
                    .filter_map(|v| coerce(inner, v, currency))
                    .filter(|v| !v.is_empty())
                    .collect(),
                scalar => coerce(inner, scalar, currency).into_iter().collect(),
            };
            (!items.is_empty()).then_some(FieldValue::List { items })
        }
        FieldKind::Group(specs) => {
            let obj = value.as_object()?;
            let fields: BTreeMap<String, Option<FieldValue>> = specs
                .iter()
                .map(|spec| {
                    let v = lookup(obj, spec.name)
                        .and_then(|v| coerce(&spec.kind, v, currency))
                        .filter(|v| !v.is_empty());
                    (spec.name.to_string(), v)
                })
                .collect();
            let group = FieldValue::Group { fields };
            (!group.is_empty()).then_some(group)
        }
    }
}

/// Pull the JSON object out of a model response.
///
/// Tolerates markdown code fences and prose around the object.
pub fn parse_response_object(raw: &str) -> Result<Map<String, Value>, String> {
    let start = raw
        .find('{')
        .ok_or_else(|| "response contains no JSON object".to_string())?;
    let end = raw
        .rfind('}')
        .filter(|e| *e > start)
        .ok_or_else(|| "response contains no complete JSON object".to_string())?;
    match serde_json::from_str::<Value>(&raw[start..=end]) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err("response is not a JSON object".to_string()),
        Err(e) => Err(format!("invalid JSON: {e}")),
    }
}
