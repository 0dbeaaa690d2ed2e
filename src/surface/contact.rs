//! Anrufer / Gesprächspartner

use serde::{Deserialize, Serialize};

/// Gesprächspartner, wie er in Benachrichtigung und Call-Fenster erscheint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub name: String,
    pub avatar: Option<String>,
}

impl Contact {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            avatar: None,
        }
    }

    pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
        self.avatar = Some(avatar.into());
        self
    }

    /// Anfangsbuchstaben aller Namensteile ("Ada Lovelace" → "AL")
    pub fn initials(&self) -> String {
        self.name
            .split_whitespace()
            .filter_map(|part| part.chars().next())
            .collect()
    }

    /// Erster Buchstabe in Großschreibung, "?" bei leerem Namen
    pub fn monogram(&self) -> String {
        match self.name.trim().chars().next() {
            Some(c) => c.to_uppercase().collect(),
            None => "?".to_string(),
        }
    }
}
