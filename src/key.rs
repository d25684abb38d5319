// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The canonical `project:region:name` instance key.

use crate::error::{Error, Result};
use std::fmt;

/// A parsed `project:region:name` Cloud SQL instance identifier.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct InstanceConnectionName {
    project: String,
    region: String,
    name: String,
}

impl InstanceConnectionName {
    /// Parses a key of the form `project:region:name`. Empty components are
    /// rejected.
    pub fn parse(key: &str) -> Result<Self> {
        let parts: Vec<&str> = key.split(':').collect();
        let [project, region, name] = parts.as_slice() else {
            return Err(Error::config(format!(
                "instance key must have exactly three ':'-separated parts, got: {key}"
            )));
        };
        if project.is_empty() || region.is_empty() || name.is_empty() {
            return Err(Error::config(format!(
                "instance key parts must not be empty, got: {key}"
            )));
        }
        Ok(Self {
            project: project.to_string(),
            region: region.to_string(),
            name: name.to_string(),
        })
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Renders the `region~name` form the admin API expects for
    /// `connect.generateEphemeralCert`.
    pub fn region_tilde_name(&self) -> String {
        format!("{}~{}", self.region, self.name)
    }

    /// The key string as used by the instance registry's map.
    pub fn as_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for InstanceConnectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.project, self.region, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_key() {
        let k = InstanceConnectionName::parse("my-project:us-central1:my-db").unwrap();
        assert_eq!(k.project(), "my-project");
        assert_eq!(k.region(), "us-central1");
        assert_eq!(k.name(), "my-db");
        assert_eq!(k.region_tilde_name(), "us-central1~my-db");
        assert_eq!(k.to_string(), "my-project:us-central1:my-db");
    }

    #[test]
    fn rejects_wrong_part_count() {
        assert!(InstanceConnectionName::parse("a:b").is_err());
        assert!(InstanceConnectionName::parse("a:b:c:d").is_err());
        assert!(InstanceConnectionName::parse("noop").is_err());
    }

    #[test]
    fn rejects_empty_parts() {
        assert!(InstanceConnectionName::parse(":b:c").is_err());
        assert!(InstanceConnectionName::parse("a::c").is_err());
        assert!(InstanceConnectionName::parse("a:b:").is_err());
    }
}
