// cvar.rs — dynamic variable tracking
//
// Copyright (C) 1999-2005 Id Software, Inc.
// Licensed under the GNU General Public License v2.

use std::collections::HashMap;

// ============================================================
// Flags
// ============================================================

/// set to cause it to be saved to vars.rc
pub const CVAR_ARCHIVE: i32 = 0x0001;
/// sent to server on connect or change
pub const CVAR_USERINFO: i32 = 0x0002;
/// sent in response to front end requests
pub const CVAR_SERVERINFO: i32 = 0x0004;
/// these cvars will be duplicated on all clients
pub const CVAR_SYSTEMINFO: i32 = 0x0008;

/// A console variable.
#[derive(Debug, Clone)]
pub struct Cvar {
    pub name: String,
    pub string: String,
    pub flags: i32,
    /// atoi(string)
    pub integer: i32,
}

impl Cvar {
    fn assign(&mut self, value: &str) {
        self.string = value.to_string();
        self.integer = crate::q_shared::atoi(value);
    }
}

/// The cvar table.
#[derive(Debug, Default)]
pub struct CvarContext {
    pub cvar_vars: Vec<Cvar>,
    /// O(1) cvar lookup by name -> index in cvar_vars
    cvar_index: HashMap<String, usize>,
}

impl CvarContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate that a string doesn't contain characters invalid in info strings.
    pub fn info_validate(s: &str) -> bool {
        !s.contains('\\') && !s.contains('"') && !s.contains(';')
    }

    pub fn find_var_index(&self, name: &str) -> Option<usize> {
        self.cvar_index.get(name).copied()
    }

    pub fn find_var(&self, name: &str) -> Option<&Cvar> {
        self.cvar_index.get(name).map(|&idx| &self.cvar_vars[idx])
    }

    /// Get the integer value of a cvar. Returns 0 if not found.
    pub fn variable_integer(&self, name: &str) -> i32 {
        self.find_var(name).map_or(0, |var| var.integer)
    }

    /// Get or create a cvar. If it already exists, the value is not changed
    /// but flags are OR'd in.
    pub fn get(&mut self, name: &str, value: &str, flags: i32) -> Option<usize> {
        if flags & (CVAR_USERINFO | CVAR_SERVERINFO) != 0 && !Self::info_validate(name) {
            log::warn!("invalid info cvar name");
            return None;
        }

        if let Some(&idx) = self.cvar_index.get(name) {
            self.cvar_vars[idx].flags |= flags;
            return Some(idx);
        }

        if flags & (CVAR_USERINFO | CVAR_SERVERINFO) != 0 && !Self::info_validate(value) {
            log::warn!("invalid info cvar value");
            return None;
        }

        let idx = self.cvar_vars.len();
        let mut var = Cvar {
            name: name.to_string(),
            string: String::new(),
            flags,
            integer: 0,
        };
        var.assign(value);
        self.cvar_vars.push(var);
        self.cvar_index.insert(name.to_string(), idx);

        Some(idx)
    }

    /// Set a cvar value, creating it when missing.
    pub fn set(&mut self, name: &str, value: &str) -> Option<usize> {
        let idx = match self.find_var_index(name) {
            Some(idx) => idx,
            None => return self.get(name, value, 0),
        };
        let var = &mut self.cvar_vars[idx];

        if var.flags & (CVAR_USERINFO | CVAR_SERVERINFO) != 0 && !Self::info_validate(value) {
            log::warn!("invalid info cvar value");
            return Some(idx);
        }

        var.assign(value);
        Some(idx)
    }
}
