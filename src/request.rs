//! Inbound install requests: wire format, decoding and validation.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::error::{ProvisionError, ValidationError};
use crate::playbook::DbType;

/// Install request as published by producers.
///
/// Every field defaults when absent so that a missing field surfaces as a
/// validation error naming it rather than as a decode error.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct InstallRequest {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub ip_address: String,
    #[serde(default)]
    pub vm_user: String,
    #[serde(default)]
    pub vm_password: String,
    #[serde(default)]
    pub db_type: String,
    #[serde(default)]
    pub db_user: String,
    #[serde(default)]
    pub db_password: String,
    #[serde(default)]
    pub db_name: String,
}

impl fmt::Debug for InstallRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstallRequest")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("ip_address", &self.ip_address)
            .field("vm_user", &self.vm_user)
            .field("vm_password", &"***")
            .field("db_type", &self.db_type)
            .field("db_user", &self.db_user)
            .field("db_password", &"***")
            .field("db_name", &self.db_name)
            .finish()
    }
}

pub fn decode_request(payload: &[u8]) -> Result<InstallRequest, ProvisionError> {
    serde_json::from_slice(payload).map_err(ProvisionError::MalformedMessage)
}

impl InstallRequest {
    pub fn validate(self) -> Result<ValidatedRequest, ValidationError> {
        if self.id == 0 {
            return Err(ValidationError::MissingId);
        }
        if self.name.trim().is_empty() {
            return Err(ValidationError::MissingName);
        }
        let ip_address: IpAddr =
            self.ip_address
                .parse()
                .map_err(|err: std::net::AddrParseError| ValidationError::InvalidIpAddress {
                    value: self.ip_address.clone(),
                    reason: err.to_string(),
                })?;
        if self.vm_user.is_empty() || self.vm_password.is_empty() {
            return Err(ValidationError::MissingVmCredentials);
        }
        if self.db_name.is_empty() || self.db_user.is_empty() || self.db_password.is_empty() {
            return Err(ValidationError::MissingDbCredentials);
        }
        // Inventory values are written unquoted on a single host line.
        for (field, value) in [
            ("vm_user", &self.vm_user),
            ("vm_password", &self.vm_password),
            ("db_name", &self.db_name),
            ("db_user", &self.db_user),
            ("db_password", &self.db_password),
        ] {
            if value.chars().any(|ch| ch.is_whitespace() || ch.is_control()) {
                return Err(ValidationError::UnsafeCredential { field });
            }
        }
        let db_type = DbType::parse(&self.db_type).ok_or_else(|| {
            ValidationError::UnsupportedDbType {
                value: self.db_type.clone(),
                supported: DbType::supported(),
            }
        })?;

        Ok(ValidatedRequest {
            id: self.id,
            name: self.name,
            ip_address,
            vm_user: self.vm_user,
            vm_password: self.vm_password,
            db_type,
            db_type_tag: self.db_type,
            db_user: self.db_user,
            db_password: self.db_password,
            db_name: self.db_name,
        })
    }
}

/// A request that passed every check; the only input the inventory writer accepts.
#[derive(Clone)]
pub struct ValidatedRequest {
    pub id: i64,
    pub name: String,
    pub ip_address: IpAddr,
    pub vm_user: String,
    pub vm_password: String,
    pub db_type: DbType,
    /// The type tag exactly as the producer sent it.
    pub db_type_tag: String,
    pub db_user: String,
    pub db_password: String,
    pub db_name: String,
}

impl fmt::Debug for ValidatedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidatedRequest")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("ip_address", &self.ip_address)
            .field("db_type", &self.db_type)
            .field("db_name", &self.db_name)
            .finish_non_exhaustive()
    }
}
