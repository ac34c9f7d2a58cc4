use crate::calc::SchoolVariant;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{get_optional_str, get_required_str, with_workspace};
use crate::ipc::types::{AppState, Request};
use crate::report::{self, ReportContext, ReportFilters};
use rusqlite::Connection;
use serde_json::Value;

fn to_result<T: serde::Serialize>(value: &T) -> Result<Value, HandlerErr> {
    serde_json::to_value(value).map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

fn reports_final_open(
    conn: &Connection,
    variant: SchoolVariant,
    params: &Value,
) -> Result<Value, HandlerErr> {
    let filters = ReportFilters {
        student_id: get_optional_str(params, "studentId")?,
        subject_id: get_optional_str(params, "subjectId")?,
    };
    let ctx = ReportContext { conn, variant };
    let model = report::compute_final_report(&ctx, &filters)?;
    to_result(&model)
}

fn reports_student_subject(
    conn: &Connection,
    variant: SchoolVariant,
    params: &Value,
) -> Result<Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let subject_id = get_required_str(params, "subjectId")?;
    let ctx = ReportContext { conn, variant };
    let row = report::compute_student_subject(&ctx, &student_id, &subject_id)?;
    to_result(&row)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "reports.finalOpen" => Some(with_workspace(state, req, reports_final_open)),
        "reports.studentSubject" => Some(with_workspace(state, req, reports_student_subject)),
        _ => None,
    }
}
