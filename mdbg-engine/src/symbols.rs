// Symbol adapter
//
// Maps method + instruction offset <-> source location. The engine consumes it
// through the `SymbolAdapter` trait; `SymbolTable` is the in-memory
// implementation fed with per-module sequence point tables.

use crate::types::{MethodRef, MethodToken, ModuleId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// Line number the compiler uses for hidden sequence points.
pub const HIDDEN_LINE: u32 = 0xFEEFEE;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencePoint {
    pub offset: u32,
    pub start_line: u32,
    pub end_line: u32,
    pub start_column: u32,
    pub end_column: u32,
}

impl SequencePoint {
    pub fn is_hidden(&self) -> bool {
        self.start_line == HIDDEN_LINE
    }
}

/// Offsets where an async method suspends (`yield_offset`) and where the
/// continuation picks up (`resume_offset`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwaitBlock {
    pub yield_offset: u32,
    pub resume_offset: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsyncSteppingInfo {
    pub awaits: Vec<AwaitBlock>,
    pub last_user_code_offset: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalName {
    pub slot: u32,
    pub name: String,
    pub start_offset: u32,
    pub end_offset: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodSymbols {
    pub token: MethodToken,
    pub document: String,
    pub code_size: u32,
    /// Sorted by offset.
    pub sequence_points: Vec<SequencePoint>,
    pub async_info: Option<AsyncSteppingInfo>,
    pub locals: Vec<LocalName>,
    pub imported_namespaces: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSymbols {
    pub methods: Vec<MethodSymbols>,
    pub entry_point: Option<MethodToken>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedBreakpoint {
    pub method: MethodRef,
    pub offset: u32,
    pub line: u32,
    pub end_line: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
    pub end_line: u32,
    pub column: u32,
    pub end_column: u32,
}

pub trait SymbolAdapter: Send + Sync {
    /// Resolve `file:line` inside `module` to a method and offset.
    fn resolve_breakpoint(&self, module: ModuleId, file: &str, line: u32)
        -> Option<ResolvedBreakpoint>;
    fn source_location(&self, method: MethodRef, offset: u32) -> Option<SourceLocation>;
    /// Offset range `[start, end)` of the sequence point containing `offset`.
    fn sequence_point_range(&self, method: MethodRef, offset: u32) -> Option<(u32, u32)>;
    fn async_stepping_info(&self, method: MethodRef) -> Option<AsyncSteppingInfo>;
    fn method_has_symbols(&self, method: MethodRef) -> bool;
    fn method_code_size(&self, method: MethodRef) -> Option<u32>;
    fn local_names(&self, method: MethodRef, offset: u32) -> Vec<LocalName>;
    fn imported_namespaces(&self, method: MethodRef) -> Vec<String>;
    fn entry_point(&self, module: ModuleId) -> Option<MethodRef>;
}

struct LoadedModule {
    methods: HashMap<MethodToken, MethodSymbols>,
    entry_point: Option<MethodToken>,
}

#[derive(Default)]
pub struct SymbolTable {
    modules: RwLock<HashMap<ModuleId, LoadedModule>>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_module(&self, module: ModuleId, symbols: ModuleSymbols) {
        let methods = symbols
            .methods
            .into_iter()
            .map(|mut m| {
                m.sequence_points.sort_by_key(|sp| sp.offset);
                (m.token, m)
            })
            .collect();
        let loaded = LoadedModule {
            methods,
            entry_point: symbols.entry_point,
        };
        self.modules
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(module, loaded);
    }

    pub fn remove_module(&self, module: ModuleId) {
        self.modules
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&module);
    }

    fn with_method<T>(&self, method: MethodRef, f: impl FnOnce(&MethodSymbols) -> T) -> Option<T> {
        let modules = self.modules.read().unwrap_or_else(|e| e.into_inner());
        let symbols = modules.get(&method.module)?.methods.get(&method.token)?;
        Some(f(symbols))
    }
}

/// Compare source paths the way users type them: separators and case are
/// normalized, and a bare file name matches any directory.
fn same_document(document: &str, requested: &str) -> bool {
    let norm = |s: &str| s.replace('\\', "/").to_lowercase();
    let document = norm(document);
    let requested = norm(requested);
    if document == requested || document.ends_with(&format!("/{}", requested)) {
        return true;
    }
    let file_name = |s: &str| s.rsplit('/').next().unwrap_or("").to_string();
    !requested.contains('/') && file_name(&document) == requested
}

/// Sequence point in effect at `offset`: the last one starting at or before it.
fn point_at(points: &[SequencePoint], offset: u32) -> Option<(usize, &SequencePoint)> {
    let idx = points.partition_point(|sp| sp.offset <= offset);
    let idx = idx.checked_sub(1)?;
    Some((idx, &points[idx]))
}

impl SymbolAdapter for SymbolTable {
    fn resolve_breakpoint(
        &self,
        module: ModuleId,
        file: &str,
        line: u32,
    ) -> Option<ResolvedBreakpoint> {
        let modules = self.modules.read().unwrap_or_else(|e| e.into_inner());
        let loaded = modules.get(&module)?;

        // (method, point) covering the line exactly, else the closest one after it
        let mut exact: Option<(MethodToken, &SequencePoint)> = None;
        let mut after: Option<(MethodToken, &SequencePoint)> = None;

        for method in loaded.methods.values() {
            if !same_document(&method.document, file) {
                continue;
            }
            for sp in method.sequence_points.iter().filter(|sp| !sp.is_hidden()) {
                if sp.start_line <= line && line <= sp.end_line {
                    let better = match exact {
                        None => true,
                        // Prefer the point starting on the line, then the narrowest span
                        Some((_, cur)) => {
                            let key = |p: &SequencePoint| {
                                (p.start_line != line, p.end_line - p.start_line, p.offset)
                            };
                            key(sp) < key(cur)
                        }
                    };
                    if better {
                        exact = Some((method.token, sp));
                    }
                } else if sp.start_line > line {
                    let better = match after {
                        None => true,
                        Some((_, cur)) => (sp.start_line, sp.offset) < (cur.start_line, cur.offset),
                    };
                    if better {
                        after = Some((method.token, sp));
                    }
                }
            }
        }

        let (token, sp) = exact.or(after)?;
        Some(ResolvedBreakpoint {
            method: MethodRef::new(module, token),
            offset: sp.offset,
            line: sp.start_line,
            end_line: sp.end_line,
        })
    }

    fn source_location(&self, method: MethodRef, offset: u32) -> Option<SourceLocation> {
        self.with_method(method, |m| {
            let (_, sp) = point_at(&m.sequence_points, offset)?;
            if sp.is_hidden() {
                return None;
            }
            Some(SourceLocation {
                file: m.document.clone(),
                line: sp.start_line,
                end_line: sp.end_line,
                column: sp.start_column,
                end_column: sp.end_column,
            })
        })
        .flatten()
    }

    fn sequence_point_range(&self, method: MethodRef, offset: u32) -> Option<(u32, u32)> {
        self.with_method(method, |m| {
            let points = &m.sequence_points;
            match point_at(points, offset) {
                Some((idx, sp)) => {
                    let end = points
                        .get(idx + 1)
                        .map(|next| next.offset)
                        .unwrap_or(m.code_size);
                    Some((sp.offset, end))
                }
                // Still in the prolog
                None => points.first().map(|first| (0, first.offset)),
            }
        })
        .flatten()
    }

    fn async_stepping_info(&self, method: MethodRef) -> Option<AsyncSteppingInfo> {
        self.with_method(method, |m| m.async_info.clone()).flatten()
    }

    fn method_has_symbols(&self, method: MethodRef) -> bool {
        self.with_method(method, |m| !m.sequence_points.is_empty())
            .unwrap_or(false)
    }

    fn method_code_size(&self, method: MethodRef) -> Option<u32> {
        self.with_method(method, |m| m.code_size)
    }

    fn local_names(&self, method: MethodRef, offset: u32) -> Vec<LocalName> {
        self.with_method(method, |m| {
            m.locals
                .iter()
                .filter(|l| l.start_offset <= offset && offset < l.end_offset)
                .cloned()
                .collect()
        })
        .unwrap_or_default()
    }

    fn imported_namespaces(&self, method: MethodRef) -> Vec<String> {
        self.with_method(method, |m| m.imported_namespaces.clone())
            .unwrap_or_default()
    }

    fn entry_point(&self, module: ModuleId) -> Option<MethodRef> {
        let modules = self.modules.read().unwrap_or_else(|e| e.into_inner());
        let token = modules.get(&module)?.entry_point?;
        Some(MethodRef::new(module, token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sp(offset: u32, line: u32) -> SequencePoint {
        SequencePoint {
            offset,
            start_line: line,
            end_line: line,
            start_column: 9,
            end_column: 30,
        }
    }

    fn table() -> SymbolTable {
        let table = SymbolTable::new();
        table.add_module(
            ModuleId(1),
            ModuleSymbols {
                methods: vec![MethodSymbols {
                    token: 0x06000001,
                    document: "/src/App/Program.cs".to_string(),
                    code_size: 40,
                    sequence_points: vec![sp(0, 10), sp(8, 11), sp(20, HIDDEN_LINE), sp(24, 14)],
                    async_info: None,
                    locals: vec![LocalName {
                        slot: 0,
                        name: "count".to_string(),
                        start_offset: 0,
                        end_offset: 40,
                    }],
                    imported_namespaces: vec!["System".to_string()],
                }],
                entry_point: Some(0x06000001),
            },
        );
        table
    }

    #[test]
    fn test_exact_line_binding() {
        let resolved = table()
            .resolve_breakpoint(ModuleId(1), "Program.cs", 11)
            .unwrap();
        assert_eq!(resolved.offset, 8);
        assert_eq!(resolved.line, 11);
    }

    #[test]
    fn test_blank_line_binds_to_next_sequence_point() {
        let resolved = table()
            .resolve_breakpoint(ModuleId(1), "/src/App/Program.cs", 12)
            .unwrap();
        assert_eq!(resolved.offset, 24);
        assert_eq!(resolved.line, 14);
    }

    #[test]
    fn test_no_binding_past_last_line_or_other_file() {
        let table = table();
        assert!(table.resolve_breakpoint(ModuleId(1), "Program.cs", 15).is_none());
        assert!(table.resolve_breakpoint(ModuleId(1), "Other.cs", 10).is_none());
        assert!(table.resolve_breakpoint(ModuleId(2), "Program.cs", 10).is_none());
    }

    #[test]
    fn test_ranges_and_hidden_points() {
        let table = table();
        let method = MethodRef::new(ModuleId(1), 0x06000001);
        assert_eq!(table.sequence_point_range(method, 10), Some((8, 20)));
        assert_eq!(table.sequence_point_range(method, 30), Some((24, 40)));
        assert!(table.source_location(method, 21).is_none());
        assert_eq!(table.source_location(method, 9).unwrap().line, 11);
        assert_eq!(table.entry_point(ModuleId(1)), Some(method));
        assert_eq!(table.local_names(method, 5)[0].name, "count");
    }
}
