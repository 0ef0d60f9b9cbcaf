use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub code: &'static str,
    pub severity: &'static str,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

impl Diagnostic {
    pub fn error(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            severity: "error",
            message: message.into(),
            notes: Vec::new(),
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }
}

/// JSON envelope printed by the driver with `--json`.
#[derive(Debug, Serialize)]
pub struct Report {
    pub tool: &'static str,
    pub version: &'static str,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<i64>,
    pub diagnostics: Vec<Diagnostic>,
}

impl Report {
    pub fn success(artifact: Option<String>, result: Option<i64>) -> Self {
        Self {
            tool: crate::TOOL_NAME,
            version: crate::VERSION,
            ok: true,
            artifact,
            result,
            diagnostics: Vec::new(),
        }
    }

    pub fn failure(diagnostic: Diagnostic) -> Self {
        Self {
            tool: crate::TOOL_NAME,
            version: crate::VERSION,
            ok: false,
            artifact: None,
            result: None,
            diagnostics: vec![diagnostic],
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::{Diagnostic, Report};

    #[test]
    fn failure_report_serializes_code_and_notes() {
        let report = Report::failure(
            Diagnostic::error("E0503", "stack height mismatch").with_note("in Function_4"),
        );
        let json: serde_json::Value = serde_json::from_str(&report.to_json()).unwrap();
        assert_eq!(json["ok"], false);
        assert_eq!(json["diagnostics"][0]["code"], "E0503");
        assert_eq!(json["diagnostics"][0]["notes"][0], "in Function_4");
        assert!(json.get("artifact").is_none());
    }
}
