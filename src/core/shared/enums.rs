//! Database enum types stored as SMALLINT columns.
//!
//! All enums derive the traits Diesel needs to read and write them directly,
//! plus serde for the HTTP surface.

use diesel::deserialize::{self, FromSql};
use diesel::pg::{Pg, PgValue};
use diesel::serialize::{self, Output, ToSql};
use diesel::sql_types::SmallInt;
use diesel::{AsExpression, FromSqlRow};
use serde::{Deserialize, Serialize};
use std::io::Write;

/// Severity of an audit trail entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsExpression, FromSqlRow)]
#[diesel(sql_type = SmallInt)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum AuditLevel {
    Info = 0,
    Warning = 1,
    Error = 2,
}

impl ToSql<SmallInt, Pg> for AuditLevel {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
        let v = *self as i16;
        out.write_all(&v.to_be_bytes())?;
        Ok(serialize::IsNull::No)
    }
}

impl FromSql<SmallInt, Pg> for AuditLevel {
    fn from_sql(bytes: PgValue<'_>) -> deserialize::Result<Self> {
        let value = i16::from_sql(bytes)?;
        match value {
            0 => Ok(Self::Info),
            1 => Ok(Self::Warning),
            2 => Ok(Self::Error),
            _ => Err(format!("Unknown AuditLevel: {}", value).into()),
        }
    }
}

impl std::fmt::Display for AuditLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Machine-matchable failure category carried alongside the free-text audit
/// message, so dashboards can group failures without parsing strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsExpression, FromSqlRow)]
#[diesel(sql_type = SmallInt)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum AuditCode {
    AuthFailed = 0,
    ConnectFailed = 1,
    Timeout = 2,
    FetchFailed = 3,
    ParseFailed = 4,
    StorageFailed = 5,
}

impl ToSql<SmallInt, Pg> for AuditCode {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
        let v = *self as i16;
        out.write_all(&v.to_be_bytes())?;
        Ok(serialize::IsNull::No)
    }
}

impl FromSql<SmallInt, Pg> for AuditCode {
    fn from_sql(bytes: PgValue<'_>) -> deserialize::Result<Self> {
        let value = i16::from_sql(bytes)?;
        match value {
            0 => Ok(Self::AuthFailed),
            1 => Ok(Self::ConnectFailed),
            2 => Ok(Self::Timeout),
            3 => Ok(Self::FetchFailed),
            4 => Ok(Self::ParseFailed),
            5 => Ok(Self::StorageFailed),
            _ => Err(format!("Unknown AuditCode: {}", value).into()),
        }
    }
}

impl std::fmt::Display for AuditCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AuthFailed => write!(f, "auth_failed"),
            Self::ConnectFailed => write!(f, "connect_failed"),
            Self::Timeout => write!(f, "timeout"),
            Self::FetchFailed => write!(f, "fetch_failed"),
            Self::ParseFailed => write!(f, "parse_failed"),
            Self::StorageFailed => write!(f, "storage_failed"),
        }
    }
}
