//! Template context: field values, the form data that produces them, and the
//! placeholder tokens reserved for spliced content.

use crate::bundle::Slot;
use crate::docx::picture::InlineImage;
use crate::error::DossierError;
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Field names understood by the dossier template.
pub mod fields {
    pub const COMPANY_NAME: &str = "company_name";
    pub const LEGAL_NAME: &str = "legal_name";
    pub const COMPANY_TAX_ID: &str = "company_tax_id";
    /// Long period label, e.g. `Janeiro a Dezembro de 2030`.
    pub const FISCAL_PERIOD: &str = "fiscal_period";
    /// Short period label, e.g. `01 a 12/30`.
    pub const FISCAL_PERIOD_SHORT: &str = "fiscal_period_short";
    /// Closing date of the statements, `dd/mm/yyyy`.
    pub const STATEMENTS_CLOSING_DATE: &str = "statements_closing_date";
    /// Repeatable partner records.
    pub const PARTNERS: &str = "partners";
    pub const PARTNER_NAME: &str = "name";
    pub const PARTNER_TAX_ID: &str = "tax_id";
    pub const PARTNER_ROLE: &str = "role";
    pub const BALANCE_SHEET_PART1: &str = "balance_sheet_part1";
    pub const BALANCE_SHEET_PART2: &str = "balance_sheet_part2";
    pub const INCOME_STATEMENT: &str = "income_statement";
    pub const EXPLANATORY_NOTES: &str = "explanatory_notes";
    pub const LIABILITY_LETTER: &str = "liability_letter";
}

// ── Placeholder tokens ──────────────────────────────────────────────────────

/// A literal marker such as `[[INCOME_STATEMENT]]`, rendered verbatim into
/// the document and later replaced by a whole auxiliary document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct PlaceholderToken(String);

impl PlaceholderToken {
    /// Build a token from its bare name (`INCOME_STATEMENT` → `[[INCOME_STATEMENT]]`).
    pub fn new(name: &str) -> Result<Self, DossierError> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
        if !valid {
            return Err(DossierError::InvalidConfig(format!(
                "placeholder name '{name}' must be non-empty and use A-Z, 0-9 or '_'"
            )));
        }
        Ok(Self(format!("[[{name}]]")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The token an auxiliary slot is spliced at, with its context field.
    pub fn for_slot(slot: Slot) -> Option<(&'static str, Self)> {
        let (field, name) = match slot {
            Slot::IncomeStatement => (fields::INCOME_STATEMENT, "INCOME_STATEMENT"),
            Slot::ExplanatoryNotes => (fields::EXPLANATORY_NOTES, "EXPLANATORY_NOTES"),
            Slot::LiabilityLetter => (fields::LIABILITY_LETTER, "LIABILITY_LETTER"),
            _ => return None,
        };
        Some((field, Self(format!("[[{name}]]"))))
    }
}

impl fmt::Display for PlaceholderToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Slots spliced into the rendered document, in splice order.
pub const SPLICED_SLOTS: [Slot; 3] = [
    Slot::IncomeStatement,
    Slot::ExplanatoryNotes,
    Slot::LiabilityLetter,
];

// ── Context values ──────────────────────────────────────────────────────────

/// One record of a repeatable group, keyed by attribute name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(BTreeMap<String, String>);

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Value bound to a template field.
#[derive(Debug, Clone)]
pub enum FieldValue {
    Text(String),
    Image(InlineImage),
    Group(Vec<Record>),
    Token(PlaceholderToken),
}

impl FieldValue {
    pub fn kind(&self) -> &'static str {
        match self {
            FieldValue::Text(_) => "text",
            FieldValue::Image(_) => "image",
            FieldValue::Group(_) => "list",
            FieldValue::Token(_) => "placeholder",
        }
    }
}

/// Field name → value.
#[derive(Debug, Clone, Default)]
pub struct FormContext {
    values: BTreeMap<String, FieldValue>,
}

impl FormContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, field: &str, value: FieldValue) {
        self.values.insert(field.to_string(), value);
    }

    pub fn insert_text(&mut self, field: &str, text: impl Into<String>) {
        self.insert(field, FieldValue::Text(text.into()));
    }

    pub fn insert_image(&mut self, field: &str, image: InlineImage) {
        self.insert(field, FieldValue::Image(image));
    }

    pub fn insert_group(&mut self, field: &str, records: Vec<Record>) {
        self.insert(field, FieldValue::Group(records));
    }

    pub fn insert_token(&mut self, field: &str, token: PlaceholderToken) {
        self.insert(field, FieldValue::Token(token));
    }

    /// Bind the placeholder token of every spliced slot.
    pub fn insert_placeholder_tokens(&mut self) {
        for slot in SPLICED_SLOTS {
            if let Some((field, token)) = PlaceholderToken::for_slot(slot) {
                self.insert_token(field, token);
            }
        }
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.values.get(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

// ── Form input ──────────────────────────────────────────────────────────────

const MONTHS_PT: [&str; 12] = [
    "Janeiro",
    "Fevereiro",
    "Março",
    "Abril",
    "Maio",
    "Junho",
    "Julho",
    "Agosto",
    "Setembro",
    "Outubro",
    "Novembro",
    "Dezembro",
];

fn month_name(date: NaiveDate) -> &'static str {
    MONTHS_PT[date.month0() as usize]
}

/// A reporting period given by its first and last day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiscalPeriod {
    start: NaiveDate,
    end: NaiveDate,
}

impl FiscalPeriod {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, DossierError> {
        if end < start {
            return Err(DossierError::InvalidForm(format!(
                "period end {end} is before period start {start}"
            )));
        }
        Ok(Self { start, end })
    }

    fn same_year(&self) -> bool {
        self.start.year() == self.end.year()
    }

    /// `Janeiro a Dezembro de 2030`, or `Julho de 2029 a Junho de 2030`
    /// across years.
    pub fn long_label(&self) -> String {
        if self.same_year() {
            format!(
                "{} a {} de {}",
                month_name(self.start),
                month_name(self.end),
                self.start.year()
            )
        } else {
            format!(
                "{} de {} a {} de {}",
                month_name(self.start),
                self.start.year(),
                month_name(self.end),
                self.end.year()
            )
        }
    }

    /// `01 a 12/30`, or `07/29 a 06/30` across years.
    pub fn short_label(&self) -> String {
        if self.same_year() {
            format!("{} a {}", self.start.format("%m"), self.end.format("%m/%y"))
        } else {
            format!("{} a {}", self.start.format("%m/%y"), self.end.format("%m/%y"))
        }
    }

    /// Last day of the period as `dd/mm/yyyy`.
    pub fn closing_date(&self) -> String {
        self.end.format("%d/%m/%Y").to_string()
    }
}

/// One partner or administrator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partner {
    pub name: String,
    #[serde(default)]
    pub tax_id: String,
    #[serde(default)]
    pub role: String,
}

impl Partner {
    fn to_record(&self) -> Record {
        Record::new()
            .with(fields::PARTNER_NAME, self.name.clone())
            .with(fields::PARTNER_TAX_ID, self.tax_id.clone())
            .with(fields::PARTNER_ROLE, self.role.clone())
    }
}

/// Form data as submitted by a front end.
///
/// The period can be given as a `period_start`/`period_end` date pair, from
/// which the three period labels are derived, or as explicit labels. An
/// explicit label wins over the derived one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FormInput {
    pub company_name: String,
    #[serde(default)]
    pub legal_name: String,
    #[serde(default)]
    pub company_tax_id: String,
    #[serde(default)]
    pub period_start: Option<NaiveDate>,
    #[serde(default)]
    pub period_end: Option<NaiveDate>,
    #[serde(default)]
    pub fiscal_period: Option<String>,
    #[serde(default)]
    pub fiscal_period_short: Option<String>,
    #[serde(default)]
    pub statements_closing_date: Option<String>,
    #[serde(default)]
    pub partners: Vec<Partner>,
}

impl FormInput {
    pub fn from_json(json: &str) -> Result<Self, DossierError> {
        serde_json::from_str(json).map_err(|e| DossierError::InvalidForm(e.to_string()))
    }

    pub fn period(&self) -> Result<Option<FiscalPeriod>, DossierError> {
        match (self.period_start, self.period_end) {
            (Some(start), Some(end)) => FiscalPeriod::new(start, end).map(Some),
            (None, None) => Ok(None),
            _ => Err(DossierError::InvalidForm(
                "period_start and period_end must be given together".into(),
            )),
        }
    }

    /// Text and group fields of the template context. Images and placeholder
    /// tokens are added by the pipeline.
    pub fn into_context(self) -> Result<FormContext, DossierError> {
        if self.company_name.trim().is_empty() {
            return Err(DossierError::InvalidForm("company_name is required".into()));
        }
        let period = self.period()?;
        let label = |explicit: Option<String>,
                     derive: &dyn Fn(&FiscalPeriod) -> String,
                     field: &str|
         -> Result<String, DossierError> {
            match (explicit, period.as_ref()) {
                (Some(text), _) => Ok(text),
                (None, Some(p)) => Ok(derive(p)),
                (None, None) => Err(DossierError::InvalidForm(format!(
                    "{field} is required when period_start/period_end are not given"
                ))),
            }
        };

        let mut ctx = FormContext::new();
        ctx.insert_text(fields::FISCAL_PERIOD, label(self.fiscal_period, &FiscalPeriod::long_label, fields::FISCAL_PERIOD)?);
        ctx.insert_text(
            fields::FISCAL_PERIOD_SHORT,
            label(self.fiscal_period_short, &FiscalPeriod::short_label, fields::FISCAL_PERIOD_SHORT)?,
        );
        ctx.insert_text(
            fields::STATEMENTS_CLOSING_DATE,
            label(self.statements_closing_date, &FiscalPeriod::closing_date, fields::STATEMENTS_CLOSING_DATE)?,
        );
        ctx.insert_text(fields::COMPANY_NAME, self.company_name);
        ctx.insert_text(fields::LEGAL_NAME, self.legal_name);
        ctx.insert_text(fields::COMPANY_TAX_ID, self.company_tax_id);
        ctx.insert_group(
            fields::PARTNERS,
            self.partners.iter().map(Partner::to_record).collect(),
        );
        Ok(ctx)
    }
}

/// `Dossie_Contabil_<company>.docx`, with characters that are unsafe in file
/// names replaced by `_`.
pub fn output_file_name(company_name: &str) -> String {
    let cleaned: String = company_name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    if cleaned.is_empty() {
        "Dossie_Contabil.docx".to_string()
    } else {
        format!("Dossie_Contabil_{cleaned}.docx")
    }
}
