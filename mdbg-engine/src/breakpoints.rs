// Breakpoint registry
//
// Owns requested and bound breakpoints, indexed by source file and by native
// handle. Binding goes through the symbol adapter and is retried for every
// pending breakpoint whenever a module loads.

use crate::native::NativeDebugger;
use crate::symbols::{ResolvedBreakpoint, SymbolAdapter};
use crate::types::{ModuleId, NativeBreakpointId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

const PENDING_MESSAGE: &str =
    "The breakpoint is pending and will be resolved when the module is loaded";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakpointState {
    Pending,
    Bound,
    Error,
}

/// One entry of a set-breakpoints request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakpointRequest {
    pub line: u32,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub hit_condition: Option<String>,
}

/// Hit-count rule: `==N`, `>N`, `>=N`, `<N`, `<=N`, `%N`, or a bare `N`
/// (meaning `==N`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitCondition {
    Equal(u32),
    Greater(u32),
    GreaterOrEqual(u32),
    Less(u32),
    LessOrEqual(u32),
    Multiple(u32),
}

impl HitCondition {
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let (ctor, rest): (fn(u32) -> Self, &str) = if let Some(r) = text.strip_prefix("==") {
            (Self::Equal, r)
        } else if let Some(r) = text.strip_prefix(">=") {
            (Self::GreaterOrEqual, r)
        } else if let Some(r) = text.strip_prefix("<=") {
            (Self::LessOrEqual, r)
        } else if let Some(r) = text.strip_prefix('>') {
            (Self::Greater, r)
        } else if let Some(r) = text.strip_prefix('<') {
            (Self::Less, r)
        } else if let Some(r) = text.strip_prefix('%') {
            (Self::Multiple, r)
        } else if let Some(r) = text.strip_prefix('=') {
            (Self::Equal, r)
        } else {
            (Self::Equal, text)
        };
        rest.trim().parse::<u32>().ok().map(ctor)
    }

    pub fn is_met(&self, hits: u32) -> bool {
        match *self {
            Self::Equal(n) => hits == n,
            Self::Greater(n) => hits > n,
            Self::GreaterOrEqual(n) => hits >= n,
            Self::Less(n) => hits < n,
            Self::LessOrEqual(n) => hits <= n,
            Self::Multiple(n) => n != 0 && hits % n == 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Breakpoint {
    pub id: u32,
    pub file: String,
    pub line: u32,
    state: BreakpointState,
    resolved: Option<ResolvedBreakpoint>,
    native: Option<NativeBreakpointId>,
    pub condition: Option<String>,
    pub hit_condition: Option<HitCondition>,
    pub hit_count: u32,
    pub message: Option<String>,
}

impl Breakpoint {
    fn new(id: u32, file: &str, request: &BreakpointRequest) -> Self {
        let hit_condition = request.hit_condition.as_deref().and_then(|text| {
            let parsed = HitCondition::parse(text);
            if parsed.is_none() {
                warn!("Ignoring invalid hit condition '{}' on {}:{}", text, file, request.line);
            }
            parsed
        });
        Self {
            id,
            file: file.to_string(),
            line: request.line,
            state: BreakpointState::Pending,
            resolved: None,
            native: None,
            condition: request
                .condition
                .clone()
                .filter(|c| !c.trim().is_empty()),
            hit_condition,
            hit_count: 0,
            message: Some(PENDING_MESSAGE.to_string()),
        }
    }

    pub fn state(&self) -> BreakpointState {
        self.state
    }

    pub fn resolved(&self) -> Option<&ResolvedBreakpoint> {
        self.resolved.as_ref()
    }

    /// Present iff the breakpoint is bound.
    pub fn native_handle(&self) -> Option<NativeBreakpointId> {
        self.native
    }

    fn bind(&mut self, resolved: ResolvedBreakpoint, handle: NativeBreakpointId) {
        self.state = BreakpointState::Bound;
        self.resolved = Some(resolved);
        self.native = Some(handle);
        self.message = None;
    }

    fn fail(&mut self, message: String) {
        self.state = BreakpointState::Error;
        self.resolved = None;
        self.native = None;
        self.message = Some(message);
    }

    fn unbind(&mut self) {
        self.state = BreakpointState::Pending;
        self.resolved = None;
        self.native = None;
        self.message = Some(PENDING_MESSAGE.to_string());
    }

    pub fn info(&self) -> BreakpointInfo {
        BreakpointInfo {
            id: self.id,
            verified: self.state == BreakpointState::Bound,
            source: self.file.clone(),
            line: self.resolved.map(|r| r.line).unwrap_or(self.line),
            end_line: self.resolved.map(|r| r.end_line),
            message: self.message.clone(),
        }
    }
}

/// Breakpoint status reported to the front end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakpointInfo {
    pub id: u32,
    pub verified: bool,
    pub source: String,
    pub line: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Default)]
pub struct BreakpointRegistry {
    next_id: u32,
    breakpoints: HashMap<u32, Breakpoint>,
    by_file: HashMap<String, Vec<u32>>,
    by_native: HashMap<NativeBreakpointId, u32>,
}

impl BreakpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every breakpoint of `file` and bind the new ones against the
    /// loaded modules.
    pub async fn set_breakpoints(
        &mut self,
        native: &dyn NativeDebugger,
        symbols: &dyn SymbolAdapter,
        modules: &[ModuleId],
        file: &str,
        requests: &[BreakpointRequest],
    ) -> Vec<BreakpointInfo> {
        for id in self.by_file.remove(file).unwrap_or_default() {
            let Some(old) = self.breakpoints.remove(&id) else {
                continue;
            };
            if let Some(handle) = old.native {
                self.by_native.remove(&handle);
                if let Err(e) = native.set_breakpoint_active(handle, false).await {
                    warn!("Failed to deactivate breakpoint {} ({:?}): {}", id, handle, e);
                }
            }
        }

        let mut ids = Vec::with_capacity(requests.len());
        for request in requests {
            self.next_id += 1;
            let id = self.next_id;
            self.breakpoints
                .insert(id, Breakpoint::new(id, file, request));
            ids.push(id);
        }
        self.by_file.insert(file.to_string(), ids.clone());

        let mut infos = Vec::with_capacity(ids.len());
        for id in ids {
            self.try_bind(native, symbols, id, modules).await;
            if let Some(bp) = self.breakpoints.get(&id) {
                infos.push(bp.info());
            }
        }
        infos
    }

    /// Retry every pending breakpoint against a freshly loaded module.
    /// Returns the breakpoints whose status changed.
    pub async fn on_module_loaded(
        &mut self,
        native: &dyn NativeDebugger,
        symbols: &dyn SymbolAdapter,
        module: ModuleId,
    ) -> Vec<BreakpointInfo> {
        let mut pending: Vec<u32> = self
            .breakpoints
            .values()
            .filter(|bp| bp.state == BreakpointState::Pending)
            .map(|bp| bp.id)
            .collect();
        pending.sort_unstable();

        let mut changed = Vec::new();
        for id in pending {
            if self.try_bind(native, symbols, id, &[module]).await {
                if let Some(bp) = self.breakpoints.get(&id) {
                    changed.push(bp.info());
                }
            }
        }
        changed
    }

    /// Breakpoints bound inside an unloaded module go back to pending.
    pub fn on_module_unloaded(&mut self, module: ModuleId) -> Vec<BreakpointInfo> {
        let mut changed = Vec::new();
        for bp in self.breakpoints.values_mut() {
            if bp.resolved.map(|r| r.method.module) == Some(module) {
                if let Some(handle) = bp.native {
                    self.by_native.remove(&handle);
                }
                bp.unbind();
                changed.push(bp.info());
            }
        }
        changed
    }

    /// First matching module wins. Returns true when the breakpoint changed
    /// state (bound or failed).
    async fn try_bind(
        &mut self,
        native: &dyn NativeDebugger,
        symbols: &dyn SymbolAdapter,
        id: u32,
        modules: &[ModuleId],
    ) -> bool {
        let Some((file, line)) = self.breakpoints.get(&id).map(|bp| (bp.file.clone(), bp.line))
        else {
            return false;
        };

        let Some(resolved) = modules
            .iter()
            .find_map(|module| symbols.resolve_breakpoint(*module, &file, line))
        else {
            debug!("Breakpoint {} at {}:{} stays pending", id, file, line);
            return false;
        };

        let created = native.create_breakpoint(resolved.method, resolved.offset).await;
        let Some(bp) = self.breakpoints.get_mut(&id) else {
            return false;
        };
        match created {
            Ok(handle) => {
                info!(
                    "Bound breakpoint {} at {}:{} -> {:?}+{:#x}",
                    id, file, resolved.line, resolved.method, resolved.offset
                );
                bp.bind(resolved, handle);
                self.by_native.insert(handle, id);
            }
            Err(e) => {
                warn!("Failed to bind breakpoint {} at {}:{}: {}", id, file, line, e);
                bp.fail(format!("Could not set breakpoint: {}", e));
            }
        }
        true
    }

    pub fn get(&self, id: u32) -> Option<&Breakpoint> {
        self.breakpoints.get(&id)
    }

    pub fn by_native(&self, handle: NativeBreakpointId) -> Option<&Breakpoint> {
        self.by_native
            .get(&handle)
            .and_then(|id| self.breakpoints.get(id))
    }

    /// Count a hit whose condition held; returns whether the hit-count rule
    /// lets the breakpoint stop.
    pub fn record_hit(&mut self, id: u32) -> bool {
        let Some(bp) = self.breakpoints.get_mut(&id) else {
            return false;
        };
        bp.hit_count += 1;
        match bp.hit_condition {
            Some(rule) => rule.is_met(bp.hit_count),
            None => true,
        }
    }

    pub fn for_file(&self, file: &str) -> Vec<&Breakpoint> {
        self.by_file
            .get(file)
            .map(|ids| ids.iter().filter_map(|id| self.breakpoints.get(id)).collect())
            .unwrap_or_default()
    }
}
