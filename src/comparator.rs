/// A named byte comparison policy. The two core comparators cover exact
/// octet comparison and ASCII case folding; extensions may contribute more
/// through their comparator tables.
pub trait Comparator: Send + Sync {
    /// Registered comparator name, e.g. `i;octet`.
    fn identifier(&self) -> &'static str;

    fn equals(&self, a: &[u8], b: &[u8]) -> bool;

    /// Single-unit comparison used by substring scans and glob matching.
    fn char_equals(&self, a: u8, b: u8) -> bool;

    /// Whether this comparator supports substring matching (`:contains`,
    /// `:matches`).
    fn supports_substring(&self) -> bool {
        true
    }
}

pub struct OctetComparator;

impl Comparator for OctetComparator {
    fn identifier(&self) -> &'static str {
        "i;octet"
    }

    fn equals(&self, a: &[u8], b: &[u8]) -> bool {
        a == b
    }

    fn char_equals(&self, a: u8, b: u8) -> bool {
        a == b
    }
}

pub struct AsciiCasemapComparator;

impl Comparator for AsciiCasemapComparator {
    fn identifier(&self) -> &'static str {
        "i;ascii-casemap"
    }

    fn equals(&self, a: &[u8], b: &[u8]) -> bool {
        a.len() == b.len() && a.iter().zip(b).all(|(&x, &y)| self.char_equals(x, y))
    }

    fn char_equals(&self, a: u8, b: u8) -> bool {
        a.to_ascii_lowercase() == b.to_ascii_lowercase()
    }
}

pub static CMP_OCTET: OctetComparator = OctetComparator;
pub static CMP_ASCII_CASEMAP: AsciiCasemapComparator = AsciiCasemapComparator;

/// Fixed core comparator table; the operand code byte indexes it.
pub fn core_comparators() -> &'static [&'static dyn Comparator] {
    static TABLE: [&'static dyn Comparator; 2] = [&CMP_OCTET, &CMP_ASCII_CASEMAP];
    &TABLE
}
