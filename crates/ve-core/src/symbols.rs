//! Symbol extraction from source files.
//!
//! Parses a source file into the set of hierarchical symbol paths it defines,
//! using `::` as the nesting separator (`Parser`, `Parser::parse`,
//! `Outer::Inner::method`). Extractors are keyed by file extension; files
//! with no registered extractor, missing files, and parse failures all yield
//! an empty set so file-level references still participate downstream.

use std::collections::BTreeSet;
use std::path::Path;
use tree_sitter::{Language, Node, Parser};

/// Languages with a registered grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolLanguage {
    Rust,
    Python,
}

impl SymbolLanguage {
    /// Detect the language from a file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "rs" => Some(Self::Rust),
            "py" => Some(Self::Python),
            _ => None,
        }
    }

    fn language(self) -> Language {
        match self {
            Self::Rust => tree_sitter_rust::LANGUAGE.into(),
            Self::Python => tree_sitter_python::LANGUAGE.into(),
        }
    }

    /// Node kinds that define a named symbol and open a new nesting level.
    fn named_item_kinds(self) -> &'static [&'static str] {
        match self {
            Self::Rust => &[
                "function_item",
                "struct_item",
                "enum_item",
                "trait_item",
                "impl_item",
                "mod_item",
            ],
            Self::Python => &["function_definition", "class_definition"],
        }
    }

    /// Field carrying the item's name. Rust impl blocks name a type.
    fn name_field(self, node_kind: &str) -> &'static str {
        match (self, node_kind) {
            (Self::Rust, "impl_item") => "type",
            _ => "name",
        }
    }
}

/// Extract all symbol paths defined in a source file.
///
/// Returns paths like `validate_short_name`, `Chunks`, `Chunks::create`,
/// `Outer::Inner::method`.
pub fn extract_symbols(path: &Path) -> BTreeSet<String> {
    let Some(lang) = SymbolLanguage::from_path(path) else {
        return BTreeSet::new();
    };
    let Ok(source) = std::fs::read_to_string(path) else {
        return BTreeSet::new();
    };
    extract_symbols_from_source(&source, lang)
}

/// Extract symbol paths from in-memory source.
pub fn extract_symbols_from_source(source: &str, lang: SymbolLanguage) -> BTreeSet<String> {
    let mut parser = Parser::new();
    if parser.set_language(&lang.language()).is_err() {
        return BTreeSet::new();
    }
    let Some(tree) = parser.parse(source, None) else {
        return BTreeSet::new();
    };

    let mut symbols = BTreeSet::new();
    let mut prefix: Vec<String> = Vec::new();
    walk(tree.root_node(), source.as_bytes(), lang, &mut prefix, &mut symbols);
    symbols
}

fn walk(
    node: Node<'_>,
    source: &[u8],
    lang: SymbolLanguage,
    prefix: &mut Vec<String>,
    symbols: &mut BTreeSet<String>,
) {
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        let kind = child.kind();
        if lang.named_item_kinds().contains(&kind) {
            if let Some(name) = item_name(child, source, lang, kind) {
                let full = if prefix.is_empty() {
                    name.clone()
                } else {
                    format!("{}::{}", prefix.join("::"), name)
                };
                symbols.insert(full);
                prefix.push(name);
                walk(child, source, lang, prefix, symbols);
                prefix.pop();
                continue;
            }
        }
        walk(child, source, lang, prefix, symbols);
    }
}

fn item_name(
    node: Node<'_>,
    source: &[u8],
    lang: SymbolLanguage,
    kind: &str,
) -> Option<String> {
    let name_node = node.child_by_field_name(lang.name_field(kind))?;
    let text = name_node.utf8_text(source).ok()?;
    // Generic impl targets like `Stack<T>` collapse to the base type name.
    let base = text.split('<').next().unwrap_or(text).trim();
    if base.is_empty() {
        None
    } else {
        Some(base.to_string())
    }
}
