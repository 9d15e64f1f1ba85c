//! Notebook cells.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type CellId = String;

/// Run index of a cell that has never been executed.
pub const NEVER_RUN: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellLanguage {
    /// Executable on the kernel.
    Code,
    /// Markdown text; never executed.
    Prose,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    pub id: CellId,
    pub language: CellLanguage,
    pub run_index: i64,
    pub content: String,
}

impl Cell {
    /// Empty cell with a fresh id.
    pub fn new(language: CellLanguage) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), language)
    }

    pub fn with_id(id: impl Into<CellId>, language: CellLanguage) -> Self {
        Self {
            id: id.into(),
            language,
            run_index: NEVER_RUN,
            content: String::new(),
        }
    }

    pub fn is_executable(&self) -> bool {
        self.language == CellLanguage::Code
    }

    pub fn has_run(&self) -> bool {
        self.run_index != NEVER_RUN
    }
}

/// Field-level change to a cell. Unset fields are left alone; set fields
/// overwrite (last write wins, no text merge).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<CellLanguage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl CellPatch {
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn language(language: CellLanguage) -> Self {
        Self {
            language: Some(language),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.language.is_none() && self.content.is_none()
    }

    pub fn apply(&self, cell: &mut Cell) {
        if let Some(language) = self.language {
            cell.language = language;
        }
        if let Some(ref content) = self.content {
            cell.content.clone_from(content);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_cell_never_ran() {
        let cell = Cell::new(CellLanguage::Code);
        assert!(!cell.has_run());
        assert!(cell.is_executable());
        assert!(Uuid::parse_str(&cell.id).is_ok());
        assert!(!Cell::new(CellLanguage::Prose).is_executable());
    }

    #[test]
    fn test_patch_only_touches_set_fields() {
        let mut cell = Cell::with_id("c1", CellLanguage::Code);
        cell.content = "x = 1".into();

        CellPatch::language(CellLanguage::Prose).apply(&mut cell);
        assert_eq!(cell.language, CellLanguage::Prose);
        assert_eq!(cell.content, "x = 1");

        CellPatch::content("# Title").apply(&mut cell);
        assert_eq!(cell.content, "# Title");
        assert_eq!(cell.id, "c1");
    }

    #[test]
    fn test_patch_wire_format_skips_unset() {
        let json = serde_json::to_string(&CellPatch::content("a")).unwrap();
        assert_eq!(json, r#"{"content":"a"}"#);
        let patch: CellPatch = serde_json::from_str("{}").unwrap();
        assert!(patch.is_empty());
    }
}
