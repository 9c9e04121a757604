use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Reference data the registration form needs while offline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    CurrentSession,
    AddressTemplate,
    RelationshipTypes,
    PatientIdentifierTypes,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::CurrentSession,
        ResourceKind::AddressTemplate,
        ResourceKind::RelationshipTypes,
        ResourceKind::PatientIdentifierTypes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::CurrentSession => "current-session",
            ResourceKind::AddressTemplate => "address-template",
            ResourceKind::RelationshipTypes => "relationship-types",
            ResourceKind::PatientIdentifierTypes => "patient-identifier-types",
        }
    }

    /// REST path and query, relative to the server base url.
    pub fn endpoint(&self) -> &'static str {
        match self {
            ResourceKind::CurrentSession => {
                "/ws/rest/v1/session?v=custom:(uuid,authenticated,user,sessionLocation)"
            }
            ResourceKind::AddressTemplate => {
                "/ws/rest/v1/systemsetting?q=layout.address.format&v=custom:(value)"
            }
            ResourceKind::RelationshipTypes => "/ws/rest/v1/relationshiptype?v=default",
            ResourceKind::PatientIdentifierTypes => {
                "/ws/rest/v1/patientidentifiertype?v=custom:(display,uuid,name,format,required,uniquenessBehavior)"
            }
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| {
                format!(
                    "Invalid resource '{}'. Valid options: current-session, address-template, relationship-types, patient-identifier-types",
                    s
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_kind_from_str() {
        assert_eq!(
            ResourceKind::from_str("address-template").unwrap(),
            ResourceKind::AddressTemplate
        );
        assert!(ResourceKind::from_str("locations").is_err());
    }

    #[test]
    fn test_endpoints_are_rest_paths() {
        for kind in ResourceKind::ALL {
            assert!(kind.endpoint().starts_with("/ws/rest/v1/"));
        }
    }
}
