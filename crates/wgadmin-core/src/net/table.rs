//! Routing-table selector resolution.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use crate::config::RouteTable;
use crate::error::NetworkError;

/// Id of the kernel's main table.
pub const MAIN_TABLE: u32 = 254;

/// Names the kernel knows without any `rt_tables` entry.
const BUILTIN_TABLES: [(&str, u32); 3] = [("default", 253), ("main", MAIN_TABLE), ("local", 255)];

/// Resolves `table` to a numeric id. `None` means the main table.
///
/// Names are looked up in the `rt_tables` registry at `rt_tables`.
///
/// # Errors
///
/// Returns `NetworkError::Table` for a name that is not registered, or if
/// the registry cannot be read.
pub fn resolve_table(table: &RouteTable, rt_tables: &Path) -> Result<Option<u32>, NetworkError> {
    match table {
        RouteTable::Auto | RouteTable::Off => Ok(None),
        RouteTable::Id(id) => Ok(Some(*id)),
        RouteTable::Named(name) => {
            let registry = match fs::read_to_string(rt_tables) {
                Ok(text) => text,
                Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
                Err(e) => return Err(NetworkError::table(name.clone(), format!("cannot read {}: {e}", rt_tables.display()))),
            };
            lookup_table_name(&registry, name)
                .or_else(|| builtin_table(name))
                .map(Some)
                .ok_or_else(|| NetworkError::table(name.clone(), format!("not listed in {}", rt_tables.display())))
        }
    }
}

/// Finds `name` in `rt_tables` content (`<id> <name>` per line).
#[must_use]
pub fn lookup_table_name(registry: &str, name: &str) -> Option<u32> {
    registry
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .find_map(|line| {
            let mut fields = line.split_whitespace();
            let id = fields.next()?.parse().ok()?;
            (fields.next()? == name).then_some(id)
        })
}

fn builtin_table(name: &str) -> Option<u32> {
    BUILTIN_TABLES.iter().find(|(n, _)| *n == name).map(|(_, id)| *id)
}
