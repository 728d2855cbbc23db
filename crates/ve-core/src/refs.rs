//! Reference algebra for symbolic code references.
//!
//! A reference is `file_path` or `file_path#symbol_path`, where the symbol
//! path nests with `::`. Containment is hierarchical: a file-only reference
//! covers every symbol in the file, and `Foo` covers `Foo::bar`. All
//! operations here are pure and total.

/// A parsed code reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CodeRef<'a> {
    pub file: &'a str,
    pub symbol: Option<&'a str>,
}

impl<'a> CodeRef<'a> {
    /// Split a reference on the first `#`. A missing symbol part means the
    /// reference covers the whole file.
    pub fn parse(raw: &'a str) -> Self {
        match raw.split_once('#') {
            Some((file, symbol)) => Self {
                file,
                symbol: Some(symbol),
            },
            None => Self {
                file: raw,
                symbol: None,
            },
        }
    }

    /// Whether `self` hierarchically contains `child`.
    ///
    /// Holds when the files match and: `self` has no symbol, the symbols are
    /// equal, or the child's symbol extends ours with `::`. Symbol paths are
    /// case-sensitive. Different files never relate.
    pub fn contains(&self, child: &CodeRef<'_>) -> bool {
        if self.file != child.file {
            return false;
        }
        let Some(parent_symbol) = self.symbol else {
            return true;
        };
        let Some(child_symbol) = child.symbol else {
            return false;
        };
        if parent_symbol == child_symbol {
            return true;
        }
        child_symbol.starts_with(parent_symbol)
            && child_symbol[parent_symbol.len()..].starts_with("::")
    }
}

/// Whether two raw references overlap: containment in either direction.
pub fn refs_overlap(a: &str, b: &str) -> bool {
    let a = CodeRef::parse(a);
    let b = CodeRef::parse(b);
    a.contains(&b) || b.contains(&a)
}
