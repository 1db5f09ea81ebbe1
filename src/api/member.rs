//! Member and security server identities.
//!
//! Members are identified on the wire as `INSTANCE/CLASS/CODE`, subsystems
//! append a fourth segment.

use std::fmt;
use std::str::FromStr;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};


//------------ ClientId ------------------------------------------------------

/// A member, or a subsystem of a member.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ClientId {
    instance: String,
    member_class: String,
    member_code: String,
    subsystem_code: Option<String>,
}

impl ClientId {
    pub fn member(
        instance: impl Into<String>,
        member_class: impl Into<String>,
        member_code: impl Into<String>,
    ) -> Self {
        ClientId {
            instance: instance.into(),
            member_class: member_class.into(),
            member_code: member_code.into(),
            subsystem_code: None,
        }
    }

    pub fn subsystem(
        instance: impl Into<String>,
        member_class: impl Into<String>,
        member_code: impl Into<String>,
        subsystem_code: impl Into<String>,
    ) -> Self {
        ClientId {
            subsystem_code: Some(subsystem_code.into()),
            ..Self::member(instance, member_class, member_code)
        }
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn member_class(&self) -> &str {
        &self.member_class
    }

    pub fn member_code(&self) -> &str {
        &self.member_code
    }

    pub fn subsystem_code(&self) -> Option<&str> {
        self.subsystem_code.as_deref()
    }

    /// Returns the owning member, i.e. this id without the subsystem.
    pub fn member_id(&self) -> ClientId {
        ClientId {
            subsystem_code: None,
            ..self.clone()
        }
    }

    /// Returns whether this id and `other` belong to the same member.
    pub fn same_member(&self, other: &ClientId) -> bool {
        self.instance == other.instance
            && self.member_class == other.member_class
            && self.member_code == other.member_code
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f, "{}/{}/{}",
            self.instance, self.member_class, self.member_code
        )?;
        if let Some(subsystem) = &self.subsystem_code {
            write!(f, "/{subsystem}")?;
        }
        Ok(())
    }
}

impl FromStr for ClientId {
    type Err = InvalidIdentity;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('/').collect();
        if parts.iter().any(|part| part.trim().is_empty()) {
            return Err(InvalidIdentity(s.to_string()))
        }
        match parts.as_slice() {
            [instance, class, code] => {
                Ok(ClientId::member(*instance, *class, *code))
            }
            [instance, class, code, subsystem] => {
                Ok(ClientId::subsystem(*instance, *class, *code, *subsystem))
            }
            _ => Err(InvalidIdentity(s.to_string())),
        }
    }
}

impl Serialize for ClientId {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ClientId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let string = String::deserialize(d)?;
        ClientId::from_str(&string).map_err(de::Error::custom)
    }
}


//------------ SecurityServerId ----------------------------------------------

/// A security server, identified by its owner and server code.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct SecurityServerId {
    pub owner: ClientId,
    pub server_code: String,
}

impl SecurityServerId {
    pub fn new(owner: ClientId, server_code: impl Into<String>) -> Self {
        SecurityServerId {
            owner: owner.member_id(),
            server_code: server_code.into(),
        }
    }
}

impl fmt::Display for SecurityServerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SERVER:{}/{}", self.owner, self.server_code)
    }
}


//------------ InvalidIdentity -----------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InvalidIdentity(String);

impl fmt::Display for InvalidIdentity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "invalid member identifier '{}', expected \
             INSTANCE/CLASS/CODE[/SUBSYSTEM]",
            self.0
        )
    }
}

impl std::error::Error for InvalidIdentity { }


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_member_and_subsystem() {
        let member = ClientId::from_str("EE/GOV/1234").unwrap();
        assert_eq!(member.subsystem_code(), None);
        assert_eq!(member.to_string(), "EE/GOV/1234");

        let subsystem = ClientId::from_str("EE/GOV/1234/MANAGEMENT").unwrap();
        assert_eq!(subsystem.subsystem_code(), Some("MANAGEMENT"));
        assert_eq!(subsystem.member_id(), member);
        assert!(subsystem.same_member(&member));
    }

    #[test]
    fn reject_malformed() {
        assert!(ClientId::from_str("EE/GOV").is_err());
        assert!(ClientId::from_str("EE//1234").is_err());
        assert!(ClientId::from_str("A/B/C/D/E").is_err());
    }

    #[test]
    fn json_uses_wire_format() {
        let id = ClientId::subsystem("EE", "COM", "42", "SUB");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"EE/COM/42/SUB\"");
        let back: ClientId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
