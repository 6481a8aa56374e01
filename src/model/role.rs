//! # Viewer roles with a strict access hierarchy.
//!
//! `Base ⊂ Elevated ⊂ Full`: every field a lower role may see, a higher role
//! may see as well. The ordering is encoded in the enum discriminants so the
//! hierarchy check is a plain comparison.

/// Role of a subscription's viewer, deciding which record fields it may see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Role {
    /// Key, odometer, and timestamp only.
    Base,
    /// Base plus live telemetry (fuel, engine, location, speed, ...).
    Elevated,
    /// Everything, including maintenance history and driver assignment.
    Full,
}

impl Role {
    /// Parses a role name case-insensitively.
    ///
    /// Unknown or empty input falls back to [`Role::Base`] — an unrecognized
    /// caller never gains visibility it did not ask for by name.
    pub fn parse(s: &str) -> Role {
        match s.trim().to_ascii_lowercase().as_str() {
            "elevated" => Role::Elevated,
            "full" => Role::Full,
            _ => Role::Base,
        }
    }

    /// True if this role sees at least everything `other` sees.
    #[inline]
    pub fn covers(self, other: Role) -> bool {
        self >= other
    }

    /// Stable lowercase name for logs and events.
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Base => "base",
            Role::Elevated => "elevated",
            Role::Full => "full",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!(Role::parse("FULL"), Role::Full);
        assert_eq!(Role::parse("Elevated"), Role::Elevated);
        assert_eq!(Role::parse("base"), Role::Base);
    }

    #[test]
    fn unknown_role_falls_back_to_base() {
        assert_eq!(Role::parse(""), Role::Base);
        assert_eq!(Role::parse("admin"), Role::Base);
        assert_eq!(Role::parse("  superuser "), Role::Base);
    }

    #[test]
    fn hierarchy_is_strict() {
        assert!(Role::Full.covers(Role::Elevated));
        assert!(Role::Elevated.covers(Role::Base));
        assert!(Role::Full.covers(Role::Full));
        assert!(!Role::Base.covers(Role::Elevated));
    }
}
