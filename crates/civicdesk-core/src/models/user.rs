use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Portal role. Controls which areas of the portal a user may open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Citizen,
    Councillor,
    Officer,
    Admin,
}

impl Role {
    /// Landing route after login
    pub fn home_route(&self) -> &'static str {
        match self {
            Role::Citizen => "/citizen",
            Role::Councillor => "/councillor",
            Role::Officer => "/officer",
            Role::Admin => "/admin",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Role::Citizen => "Citizen",
            Role::Councillor => "Councillor",
            Role::Officer => "Officer",
            Role::Admin => "Admin",
        }
    }
}

/// User record as returned by the auth endpoint.
///
/// Fields the portal does not interpret are kept in `extra` so the record
/// survives a store/load cycle unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct UserRecord {
    #[serde(alias = "_id")]
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ward: Option<String>,
    #[serde(flatten)]
    #[cfg_attr(feature = "ts", ts(skip))]
    pub extra: Map<String, Value>,
}

impl UserRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            email: None,
            phone: None,
            role,
            ward: None,
            extra: Map::new(),
        }
    }

    /// Name with ward suffix for display, e.g. "Asha Rao (Ward 12)"
    pub fn display_name(&self) -> String {
        match self.ward.as_deref() {
            Some(ward) if !ward.is_empty() => format!("{} (Ward {})", self.name, ward),
            _ => self.name.clone(),
        }
    }
}
