use std::collections::BTreeMap;
use std::fmt;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::errors::{AppError, AppResult};
use crate::normalize;

/// One row as stored by a backend: canonical column name to cell text.
pub type RawRow = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
    Tasks,
    ExtraActivities,
    Audits,
    PostApplication,
}

#[derive(Debug, Clone, Copy)]
pub struct Column {
    pub name: &'static str,
    pub synonyms: &'static [&'static str],
    pub required: bool,
}

const fn column(name: &'static str, synonyms: &'static [&'static str], required: bool) -> Column {
    Column {
        name,
        synonyms,
        required,
    }
}

const TASK_COLUMNS: &[Column] = &[
    column("date", &["data"], true),
    column("sector", &["setor"], true),
    column("collaborator", &["colaborador"], true),
    column("kind", &["tipo", "type"], false),
    column("status", &[], false),
];

const EXTRA_ACTIVITY_COLUMNS: &[Column] = &[
    column("date", &["data"], true),
    column("collaborator", &["colaborador"], true),
    column("requester", &["solicitante"], false),
    column(
        "requester_sector",
        &["setorsolicitante", "setor solicitante"],
        false,
    ),
    column("activity", &["atividade"], true),
    column("hours", &["horas"], false),
];

const AUDIT_COLUMNS: &[Column] = &[
    column("date", &["data"], true),
    column("auditors", &["auditores"], false),
    column("unit", &["unidade"], true),
    column("sector", &["setor"], true),
    column("planting_type_planned", &["tipoplantio_planejado"], false),
    column("planting_type_executed", &["tipoplantio_executado"], false),
    column("terrace_type_planned", &["tipoterraco_planejado"], false),
    column("terrace_type_executed", &["tipoterraco_executado"], false),
    column("terrace_count_planned", &["quantidadeterraco_planejado"], false),
    column("terrace_count_executed", &["quantidadeterraco_executado"], false),
    column("lifts_planned", &["levantes_planejado"], false),
    column("lifts_executed", &["levantes_executado"], false),
    column("lift_teardown_planned", &["levantesdesmanche_planejado"], false),
    column("lift_teardown_executed", &["levantesdesmanche_executado"], false),
    column("whiskers_planned", &["bigodes_planejado"], false),
    column("whiskers_executed", &["bigodes_executado"], false),
    column("whisker_teardown_planned", &["bigodesdesmanche_planejado"], false),
    column("whisker_teardown_executed", &["bigodesdesmanche_executado"], false),
    column("access_roads_planned", &["carreadores_planejado"], false),
    column("access_roads_executed", &["carreadores_executado"], false),
    column("yards_planned", &["patios_projetado", "patios_planejado"], false),
    column("yards_executed", &["patios_executado"], false),
    column("observation", &["observacao", "observação"], false),
];

const POST_APPLICATION_COLUMNS: &[Column] = &[
    column(
        "operation",
        &["desc_operação", "desc_operacao", "operação", "operacao"],
        true,
    ),
    column("date", &["data"], true),
    column("sector", &["setor"], true),
    column("plot", &["talhão", "talhao"], true),
    column("area", &["área"], true),
];

/// Planned/executed item pairs checked during a field audit, in column order.
pub const AUDIT_ITEMS: &[&str] = &[
    "planting_type",
    "terrace_type",
    "terrace_count",
    "lifts",
    "lift_teardown",
    "whiskers",
    "whisker_teardown",
    "access_roads",
    "yards",
];

impl TableKind {
    pub const ALL: [TableKind; 4] = [
        TableKind::Tasks,
        TableKind::ExtraActivities,
        TableKind::Audits,
        TableKind::PostApplication,
    ];

    pub fn slug(&self) -> &'static str {
        match self {
            TableKind::Tasks => "tasks",
            TableKind::ExtraActivities => "extra_activities",
            TableKind::Audits => "audits",
            TableKind::PostApplication => "post_application",
        }
    }

    pub fn parse(value: &str) -> AppResult<Self> {
        let normalized = value.trim().to_ascii_lowercase().replace('-', "_");
        TableKind::ALL
            .into_iter()
            .find(|kind| kind.slug() == normalized)
            .ok_or_else(|| AppError::Config(format!("unknown table: {value}")))
    }

    pub fn columns(&self) -> &'static [Column] {
        match self {
            TableKind::Tasks => TASK_COLUMNS,
            TableKind::ExtraActivities => EXTRA_ACTIVITY_COLUMNS,
            TableKind::Audits => AUDIT_COLUMNS,
            TableKind::PostApplication => POST_APPLICATION_COLUMNS,
        }
    }

    pub fn column_names(&self) -> Vec<&'static str> {
        self.columns().iter().map(|column| column.name).collect()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns().iter().any(|column| column.name == name)
    }

    /// Resolves a header cell to a canonical column name, if it names one.
    pub fn resolve_header(&self, header: &str) -> Option<&'static str> {
        let wanted = normalize::header(header);
        self.columns()
            .iter()
            .find(|column| {
                column.name == wanted || column.synonyms.iter().any(|synonym| *synonym == wanted)
            })
            .map(|column| column.name)
    }

    pub fn default_natural_key(&self) -> &'static [&'static str] {
        match self {
            TableKind::Tasks => &["date", "sector", "collaborator", "kind"],
            TableKind::ExtraActivities => &["date", "collaborator", "activity", "requester"],
            TableKind::Audits => &["date", "unit", "sector"],
            TableKind::PostApplication => &["operation", "date", "sector", "plot"],
        }
    }
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

/// Normalized scalar held by a record field.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Date(NaiveDate),
}

impl FieldValue {
    pub fn to_cell(&self) -> String {
        match self {
            FieldValue::Text(value) => value.clone(),
            FieldValue::Integer(value) => value.to_string(),
            FieldValue::Float(value) => value.to_string(),
            FieldValue::Date(value) => value.format("%Y-%m-%d").to_string(),
        }
    }

    fn text(value: &str) -> Option<Self> {
        if value.is_empty() {
            None
        } else {
            Some(FieldValue::Text(value.to_string()))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TaskStatus {
    #[default]
    ToDo,
    InProgress,
    ToValidate,
    Done,
}

impl TaskStatus {
    pub fn label(&self) -> &'static str {
        match self {
            TaskStatus::ToDo => "A fazer",
            TaskStatus::InProgress => "Em andamento",
            TaskStatus::ToValidate => "A validar",
            TaskStatus::Done => "Concluído",
        }
    }

    pub fn parse(value: &str) -> AppResult<Self> {
        let wanted = normalize::header(value);
        if wanted.is_empty() {
            return Ok(TaskStatus::default());
        }
        [
            TaskStatus::ToDo,
            TaskStatus::InProgress,
            TaskStatus::ToValidate,
            TaskStatus::Done,
        ]
        .into_iter()
        .find(|status| status.label().to_lowercase() == wanted)
        .ok_or_else(|| AppError::invalid_field("status", value, "unknown task status"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeeklyTask {
    pub date: NaiveDate,
    pub sector: i64,
    pub collaborator: String,
    pub kind: String,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtraActivity {
    pub date: NaiveDate,
    pub collaborator: String,
    pub requester: String,
    pub requester_sector: String,
    pub activity: String,
    pub hours: Option<NaiveTime>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditItem {
    pub item: &'static str,
    pub planned: String,
    pub executed: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditRecord {
    pub date: NaiveDate,
    pub auditors: Vec<String>,
    pub unit: String,
    pub sector: i64,
    pub items: Vec<AuditItem>,
    pub observation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PostApplicationRecord {
    pub operation: String,
    pub date: NaiveDate,
    pub sector: i64,
    pub plot: String,
    pub area: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "table", rename_all = "snake_case")]
pub enum Record {
    Task(WeeklyTask),
    ExtraActivity(ExtraActivity),
    Audit(AuditRecord),
    PostApplication(PostApplicationRecord),
}

impl Record {
    pub fn kind(&self) -> TableKind {
        match self {
            Record::Task(_) => TableKind::Tasks,
            Record::ExtraActivity(_) => TableKind::ExtraActivities,
            Record::Audit(_) => TableKind::Audits,
            Record::PostApplication(_) => TableKind::PostApplication,
        }
    }

    /// Validates and normalizes a raw row. Unknown cells are ignored; optional
    /// cells that are missing default to empty.
    pub fn from_raw(kind: TableKind, raw: &RawRow) -> AppResult<Self> {
        let record = match kind {
            TableKind::Tasks => Record::Task(WeeklyTask {
                date: normalize::date("date", required(raw, "date")?)?,
                sector: normalize::integer("sector", required(raw, "sector")?)?,
                collaborator: normalize::text(required(raw, "collaborator")?),
                kind: normalize::text(cell(raw, "kind")),
                status: TaskStatus::parse(cell(raw, "status"))?,
            }),
            TableKind::ExtraActivities => Record::ExtraActivity(ExtraActivity {
                date: normalize::date("date", required(raw, "date")?)?,
                collaborator: normalize::text(required(raw, "collaborator")?),
                requester: normalize::text(cell(raw, "requester")),
                requester_sector: normalize::text(cell(raw, "requester_sector")),
                activity: normalize::text(required(raw, "activity")?),
                hours: normalize::optional_time("hours", cell(raw, "hours"))?,
            }),
            TableKind::Audits => Record::Audit(AuditRecord {
                date: normalize::date("date", required(raw, "date")?)?,
                auditors: normalize::list(cell(raw, "auditors")),
                unit: normalize::text(required(raw, "unit")?),
                sector: normalize::integer("sector", required(raw, "sector")?)?,
                items: AUDIT_ITEMS
                    .iter()
                    .map(|item| AuditItem {
                        item: *item,
                        planned: normalize::text(cell(raw, &format!("{item}_planned"))),
                        executed: normalize::text(cell(raw, &format!("{item}_executed"))),
                    })
                    .collect(),
                observation: normalize::text(cell(raw, "observation")),
            }),
            TableKind::PostApplication => Record::PostApplication(PostApplicationRecord {
                operation: normalize::text(required(raw, "operation")?),
                date: normalize::date("date", required(raw, "date")?)?,
                sector: normalize::integer("sector", required(raw, "sector")?)?,
                plot: normalize::code(required(raw, "plot")?),
                area: normalize::optional_float("area", cell(raw, "area"))?,
            }),
        };
        Ok(record)
    }

    /// Normalized value of `name`, or `None` when the table has no such column
    /// or the value is empty.
    pub fn field(&self, name: &str) -> Option<FieldValue> {
        match self {
            Record::Task(task) => match name {
                "date" => Some(FieldValue::Date(task.date)),
                "sector" => Some(FieldValue::Integer(task.sector)),
                "collaborator" => FieldValue::text(&task.collaborator),
                "kind" => FieldValue::text(&task.kind),
                "status" => FieldValue::text(task.status.label()),
                _ => None,
            },
            Record::ExtraActivity(extra) => match name {
                "date" => Some(FieldValue::Date(extra.date)),
                "collaborator" => FieldValue::text(&extra.collaborator),
                "requester" => FieldValue::text(&extra.requester),
                "requester_sector" => FieldValue::text(&extra.requester_sector),
                "activity" => FieldValue::text(&extra.activity),
                "hours" => extra
                    .hours
                    .map(|hours| FieldValue::Text(hours.format("%H:%M:%S").to_string())),
                _ => None,
            },
            Record::Audit(audit) => match name {
                "date" => Some(FieldValue::Date(audit.date)),
                "auditors" => FieldValue::text(&audit.auditors.join(", ")),
                "unit" => FieldValue::text(&audit.unit),
                "sector" => Some(FieldValue::Integer(audit.sector)),
                "observation" => FieldValue::text(&audit.observation),
                other => audit_item_field(audit, other),
            },
            Record::PostApplication(post) => match name {
                "operation" => FieldValue::text(&post.operation),
                "date" => Some(FieldValue::Date(post.date)),
                "sector" => Some(FieldValue::Integer(post.sector)),
                "plot" => FieldValue::text(&post.plot),
                "area" => post.area.map(FieldValue::Float),
                _ => None,
            },
        }
    }

    pub fn to_raw(&self) -> RawRow {
        self.kind()
            .columns()
            .iter()
            .map(|column| {
                let value = self
                    .field(column.name)
                    .map(|value| value.to_cell())
                    .unwrap_or_default();
                (column.name.to_string(), value)
            })
            .collect()
    }

    /// Cell text in schema column order.
    pub fn to_cells(&self) -> Vec<String> {
        self.kind()
            .columns()
            .iter()
            .map(|column| {
                self.field(column.name)
                    .map(|value| value.to_cell())
                    .unwrap_or_default()
            })
            .collect()
    }
}

impl TableKind {
    /// Normalizes one stored cell the way [`Record::from_raw`] would and
    /// returns what [`Record::field`] reports for it. Other cells of the row
    /// are not looked at.
    pub fn normalize_cell(&self, name: &str, value: &str) -> AppResult<Option<FieldValue>> {
        let column = self
            .columns()
            .iter()
            .find(|column| column.name == name)
            .ok_or_else(|| AppError::invalid_field(name, value, "unknown column"))?;
        // `area` is a required upload header whose cells may stay blank.
        let blank_allowed =
            !column.required || matches!((self, name), (TableKind::PostApplication, "area"));
        if !blank_allowed && value.trim().is_empty() {
            return Err(AppError::invalid_field(name, value, "value is required"));
        }
        let normalized = match (self, name) {
            (_, "date") => Some(FieldValue::Date(normalize::date(name, value)?)),
            (_, "sector") => Some(FieldValue::Integer(normalize::integer(name, value)?)),
            (TableKind::PostApplication, "plot") => FieldValue::text(&normalize::code(value)),
            (TableKind::PostApplication, "area") => {
                normalize::optional_float(name, value)?.map(FieldValue::Float)
            }
            (TableKind::Tasks, "status") => FieldValue::text(TaskStatus::parse(value)?.label()),
            (TableKind::ExtraActivities, "hours") => normalize::optional_time(name, value)?
                .map(|hours| FieldValue::Text(hours.format("%H:%M:%S").to_string())),
            (TableKind::Audits, "auditors") => FieldValue::text(&normalize::list(value).join(", ")),
            _ => FieldValue::text(&normalize::text(value)),
        };
        Ok(normalized)
    }
}

fn cell<'a>(raw: &'a RawRow, name: &str) -> &'a str {
    raw.get(name).map(String::as_str).unwrap_or("")
}

fn required<'a>(raw: &'a RawRow, name: &str) -> AppResult<&'a str> {
    let value = cell(raw, name);
    if value.trim().is_empty() {
        Err(AppError::invalid_field(name, value, "value is required"))
    } else {
        Ok(value)
    }
}

fn audit_item_field(audit: &AuditRecord, name: &str) -> Option<FieldValue> {
    let (item, planned) = if let Some(item) = name.strip_suffix("_planned") {
        (item, true)
    } else if let Some(item) = name.strip_suffix("_executed") {
        (item, false)
    } else {
        return None;
    };
    let entry = audit.items.iter().find(|entry| entry.item == item)?;
    FieldValue::text(if planned {
        &entry.planned
    } else {
        &entry.executed
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(pairs: &[(&str, &str)]) -> RawRow {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn post_application_rows_normalize_key_fields() {
        let record = Record::from_raw(
            TableKind::PostApplication,
            &raw(&[
                ("operation", "  Herbicida "),
                ("date", "2024-1-5"),
                ("sector", "21.0"),
                ("plot", "12.0"),
                ("area", "3,5"),
                ("ignored", "whatever"),
            ]),
        )
        .unwrap();

        assert_eq!(record.field("operation"), Some(FieldValue::Text("Herbicida".into())));
        assert_eq!(
            record.field("date"),
            Some(FieldValue::Date(NaiveDate::from_ymd_opt(2024, 1, 5).unwrap()))
        );
        assert_eq!(record.field("sector"), Some(FieldValue::Integer(21)));
        assert_eq!(record.field("plot"), Some(FieldValue::Text("12".into())));
        assert_eq!(record.field("area"), Some(FieldValue::Float(3.5)));
        assert_eq!(record.field("ignored"), None);
        assert_eq!(
            record.to_cells(),
            vec!["Herbicida", "2024-01-05", "21", "12", "3.5"]
        );
    }

    #[test]
    fn missing_required_cells_are_rejected() {
        let err = Record::from_raw(
            TableKind::Tasks,
            &raw(&[("date", "2024-01-01"), ("collaborator", "Ana")]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("sector"));
    }

    #[test]
    fn optional_cells_default_to_empty() {
        let record = Record::from_raw(
            TableKind::Tasks,
            &raw(&[("date", "2024-01-01"), ("sector", "7"), ("collaborator", "Ana")]),
        )
        .unwrap();
        let Record::Task(task) = &record else {
            panic!("expected a task");
        };
        assert_eq!(task.status, TaskStatus::ToDo);
        assert_eq!(record.field("kind"), None);
        assert_eq!(record.to_raw().get("status").map(String::as_str), Some("A fazer"));
    }

    #[test]
    fn audit_items_round_trip_through_raw_rows() {
        let row = raw(&[
            ("date", "10/02/2024"),
            ("auditors", "Camila, Maico"),
            ("unit", "Narandiba"),
            ("sector", "30"),
            ("lifts_planned", "4"),
            ("lifts_executed", "3"),
        ]);
        let record = Record::from_raw(TableKind::Audits, &row).unwrap();
        assert_eq!(record.field("lifts_planned"), Some(FieldValue::Text("4".into())));
        assert_eq!(record.field("yards_planned"), None);
        assert_eq!(record.field("auditors"), Some(FieldValue::Text("Camila, Maico".into())));

        let reparsed = Record::from_raw(TableKind::Audits, &record.to_raw()).unwrap();
        assert_eq!(reparsed, record);
    }

    #[test]
    fn single_cells_normalize_like_whole_rows() {
        let row = raw(&[
            ("operation", " Herbicida "),
            ("date", "5/1/2024"),
            ("sector", "21,0"),
            ("plot", "012"),
            ("area", ""),
        ]);
        let record = Record::from_raw(TableKind::PostApplication, &row).unwrap();
        for (name, value) in &row {
            assert_eq!(
                TableKind::PostApplication.normalize_cell(name, value).unwrap(),
                record.field(name),
                "column {name}"
            );
        }
        assert!(TableKind::PostApplication.normalize_cell("area", "n/a").is_err());
        assert!(TableKind::PostApplication.normalize_cell("date", " ").is_err());
        assert!(TableKind::PostApplication.normalize_cell("harvest", "x").is_err());
        assert_eq!(
            TableKind::Tasks.normalize_cell("status", "").unwrap(),
            Some(FieldValue::Text("A fazer".into()))
        );
    }

    #[test]
    fn resolves_legacy_headers() {
        let kind = TableKind::PostApplication;
        assert_eq!(kind.resolve_header("DESC_OPERAÇÃO"), Some("operation"));
        assert_eq!(kind.resolve_header(" Talhão "), Some("plot"));
        assert_eq!(kind.resolve_header("AREA"), Some("area"));
        assert_eq!(kind.resolve_header("responsavel"), None);
        assert_eq!(TableKind::Audits.resolve_header("Patios_Projetado"), Some("yards_planned"));
        assert_eq!(TableKind::parse("post-application").unwrap(), kind);
    }
}
