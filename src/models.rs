use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

const NAME_MAX: usize = 60;
const EMAIL_MAX: usize = 100;
const PASSWORD_MAX: usize = 100;
const HEADER_MAX: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct User {
    pub id: i32,
    pub name: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewUser {
    pub name: String,
    pub email: String,
    pub password: Option<String>,
}

/// Fields of a user that a PATCH may change. Absent fields are left alone;
/// `"password": null` clears the password.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserPatch {
    pub name: Option<String>,
    pub email: Option<String>,
    #[serde(default, deserialize_with = "present")]
    pub password: Option<Option<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct Advertisement {
    pub id: i32,
    pub header: String,
    pub description: String,
    pub registration_time: DateTime<Utc>,
    pub owner: Option<i32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewAdvertisement {
    pub header: String,
    pub description: String,
    pub owner: Option<i32>,
}

/// No `registration_time` here: it is fixed at insert time.
/// `"owner": null` detaches the advertisement from its owner.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdvertisementPatch {
    pub header: Option<String>,
    pub description: Option<String>,
    #[serde(default, deserialize_with = "present")]
    pub owner: Option<Option<i32>>,
}

/// Marks a field as present, so an explicit `null` becomes `Some(None)`
/// while a missing field stays `None` through `#[serde(default)]`.
fn present<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

fn check_required(field: &str, value: &str, max: Option<usize>) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{field} must not be empty"));
    }
    check_length(field, value, max)
}

fn check_length(field: &str, value: &str, max: Option<usize>) -> Result<(), String> {
    match max {
        Some(max) if value.chars().count() > max => {
            Err(format!("{field} must be at most {max} characters"))
        }
        _ => Ok(()),
    }
}

impl NewUser {
    pub fn validate(&self) -> Result<(), String> {
        check_required("name", &self.name, Some(NAME_MAX))?;
        check_required("email", &self.email, Some(EMAIL_MAX))?;
        if let Some(password) = &self.password {
            check_length("password", password, Some(PASSWORD_MAX))?;
        }
        Ok(())
    }
}

impl UserPatch {
    pub fn validate(&self) -> Result<(), String> {
        if let Some(name) = &self.name {
            check_required("name", name, Some(NAME_MAX))?;
        }
        if let Some(email) = &self.email {
            check_required("email", email, Some(EMAIL_MAX))?;
        }
        if let Some(Some(password)) = &self.password {
            check_length("password", password, Some(PASSWORD_MAX))?;
        }
        Ok(())
    }
}

impl NewAdvertisement {
    pub fn validate(&self) -> Result<(), String> {
        check_required("header", &self.header, Some(HEADER_MAX))?;
        check_required("description", &self.description, None)
    }
}

impl AdvertisementPatch {
    pub fn validate(&self) -> Result<(), String> {
        if let Some(header) = &self.header {
            check_required("header", header, Some(HEADER_MAX))?;
        }
        if let Some(description) = &self.description {
            check_required("description", description, None)?;
        }
        Ok(())
    }
}
