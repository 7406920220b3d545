// verb.rs - command verbs of the memcached text protocol
//
// Every request line starts with one of these verbs. The client uses the
// verb to pick an encoder and to know which response tokens are legal; the
// stub uses `from_bytes` to dispatch incoming lines.
//
// ============================================================================
// VERB FAMILIES
// ============================================================================
//
// Storage    : set add replace append prepend cas
//              <verb> <key> <flags> <exptime> <bytes>[ <cas>]\r\n<data>\r\n
// Retrieval  : get gets
//              <verb> <key>[ <key>...]\r\n
// Arithmetic : incr decr
//              <verb> <key> <delta>\r\n
// Other      : delete touch version flush_all

/// Protocol command verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
    Cas,
    Get,
    Gets,
    Delete,
    Incr,
    Decr,
    Touch,
    Version,
    FlushAll,
}

impl Verb {
    /// All verbs, in wire-name order of the table above.
    pub const ALL: [Verb; 14] = [
        Verb::Set,
        Verb::Add,
        Verb::Replace,
        Verb::Append,
        Verb::Prepend,
        Verb::Cas,
        Verb::Get,
        Verb::Gets,
        Verb::Delete,
        Verb::Incr,
        Verb::Decr,
        Verb::Touch,
        Verb::Version,
        Verb::FlushAll,
    ];

    /// Lowercase wire spelling of the verb.
    pub const fn as_bytes(self) -> &'static [u8] {
        match self {
            Verb::Set => b"set",
            Verb::Add => b"add",
            Verb::Replace => b"replace",
            Verb::Append => b"append",
            Verb::Prepend => b"prepend",
            Verb::Cas => b"cas",
            Verb::Get => b"get",
            Verb::Gets => b"gets",
            Verb::Delete => b"delete",
            Verb::Incr => b"incr",
            Verb::Decr => b"decr",
            Verb::Touch => b"touch",
            Verb::Version => b"version",
            Verb::FlushAll => b"flush_all",
        }
    }

    /// Parses a wire token (case-sensitive, as servers are).
    pub fn from_bytes(token: &[u8]) -> Option<Self> {
        Verb::ALL.into_iter().find(|verb| verb.as_bytes() == token)
    }

    /// Returns the verb name for logs.
    pub fn name(self) -> &'static str {
        // Every spelling above is ASCII.
        std::str::from_utf8(self.as_bytes()).unwrap_or("?")
    }

    /// True for commands that carry a data block.
    pub const fn is_storage(self) -> bool {
        matches!(
            self,
            Verb::Set | Verb::Add | Verb::Replace | Verb::Append | Verb::Prepend | Verb::Cas
        )
    }

    /// True for commands answered with VALUE blocks.
    pub const fn is_retrieval(self) -> bool {
        matches!(self, Verb::Get | Verb::Gets)
    }

    /// True for counter commands.
    pub const fn is_arithmetic(self) -> bool {
        matches!(self, Verb::Incr | Verb::Decr)
    }
}

impl std::fmt::Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verb_conversion() {
        for verb in Verb::ALL {
            assert_eq!(Verb::from_bytes(verb.as_bytes()), Some(verb));
        }
    }

    #[test]
    fn test_unknown_verb() {
        assert_eq!(Verb::from_bytes(b"GET"), None);
        assert_eq!(Verb::from_bytes(b"stats"), None);
        assert_eq!(Verb::from_bytes(b""), None);
    }

    #[test]
    fn test_verb_classification() {
        assert!(Verb::Set.is_storage());
        assert!(Verb::Cas.is_storage());
        assert!(!Verb::Get.is_storage());

        assert!(Verb::Gets.is_retrieval());
        assert!(!Verb::Delete.is_retrieval());

        assert!(Verb::Decr.is_arithmetic());
        assert!(!Verb::Touch.is_arithmetic());
    }

    #[test]
    fn test_verb_display() {
        assert_eq!(Verb::FlushAll.to_string(), "flush_all");
        assert_eq!(Verb::Incr.name(), "incr");
    }
}
