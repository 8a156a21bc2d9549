use std::collections::HashMap;
use std::sync::Mutex;

use crate::breakpoint::BreakpointRule;
use crate::error::RuleError;
use crate::scripting::Script;

/// Persistence collaborator for breakpoint rules. Loaded once at startup,
/// written through on every mutation.
pub trait BreakpointRuleStore: Send + Sync {
    fn save_rule(&self, rule: &BreakpointRule) -> Result<(), RuleError>;
    fn load_rules(&self) -> Result<Vec<BreakpointRule>, RuleError>;
    fn delete_rule(&self, id: &str) -> Result<(), RuleError>;
    fn update_rule_status(&self, id: &str, enabled: bool) -> Result<(), RuleError>;
}

/// Persistence collaborator for scripts.
pub trait ScriptStore: Send + Sync {
    fn save_script(&self, script: &Script) -> Result<(), RuleError>;
    fn load_scripts(&self) -> Result<Vec<Script>, RuleError>;
    fn delete_script(&self, id: &str) -> Result<(), RuleError>;
    fn update_script_status(&self, id: &str, enabled: bool) -> Result<(), RuleError>;
}

/// In-memory implementation of both stores, for tests and embedders without
/// durable storage.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rules: Mutex<HashMap<String, BreakpointRule>>,
    scripts: Mutex<HashMap<String, Script>>,
}

impl BreakpointRuleStore for MemoryStore {
    fn save_rule(&self, rule: &BreakpointRule) -> Result<(), RuleError> {
        self.rules
            .lock()
            .expect("rule store lock poisoned")
            .insert(rule.id.clone(), rule.clone());
        Ok(())
    }

    fn load_rules(&self) -> Result<Vec<BreakpointRule>, RuleError> {
        Ok(self
            .rules
            .lock()
            .expect("rule store lock poisoned")
            .values()
            .cloned()
            .collect())
    }

    fn delete_rule(&self, id: &str) -> Result<(), RuleError> {
        self.rules
            .lock()
            .expect("rule store lock poisoned")
            .remove(id);
        Ok(())
    }

    fn update_rule_status(&self, id: &str, enabled: bool) -> Result<(), RuleError> {
        let mut rules = self.rules.lock().expect("rule store lock poisoned");
        let rule = rules
            .get_mut(id)
            .ok_or_else(|| RuleError::RuleNotFound(id.to_string()))?;
        rule.enabled = enabled;
        Ok(())
    }
}

impl ScriptStore for MemoryStore {
    fn save_script(&self, script: &Script) -> Result<(), RuleError> {
        self.scripts
            .lock()
            .expect("script store lock poisoned")
            .insert(script.id.clone(), script.clone());
        Ok(())
    }

    fn load_scripts(&self) -> Result<Vec<Script>, RuleError> {
        Ok(self
            .scripts
            .lock()
            .expect("script store lock poisoned")
            .values()
            .cloned()
            .collect())
    }

    fn delete_script(&self, id: &str) -> Result<(), RuleError> {
        self.scripts
            .lock()
            .expect("script store lock poisoned")
            .remove(id);
        Ok(())
    }

    fn update_script_status(&self, id: &str, enabled: bool) -> Result<(), RuleError> {
        let mut scripts = self.scripts.lock().expect("script store lock poisoned");
        let script = scripts
            .get_mut(id)
            .ok_or_else(|| RuleError::RuleNotFound(id.to_string()))?;
        script.enabled = enabled;
        Ok(())
    }
}
