//! Per-backend SQL spelling.

use conduit_config::DriverKind;

/// Quote an identifier for `driver`, doubling embedded quote characters.
pub(crate) fn quote(driver: DriverKind, ident: &str) -> String {
    match driver {
        DriverKind::Mysql => format!("`{}`", ident.replace('`', "``")),
        _ => format!("\"{}\"", ident.replace('"', "\"\"")),
    }
}

/// Bind placeholder for the 1-based parameter `index`.
pub(crate) fn placeholder(driver: DriverKind, index: usize) -> String {
    match driver {
        DriverKind::Postgresql => format!("${}", index),
        _ => "?".to_string(),
    }
}

/// `LIMIT`/`OFFSET` clause. Engines that cannot take an offset on its own
/// get an unbounded limit.
pub(crate) fn limit_offset(driver: DriverKind, limit: Option<u64>, offset: Option<u64>) -> String {
    match (limit, offset) {
        (None, None) => String::new(),
        (Some(limit), None) => format!(" LIMIT {}", limit),
        (Some(limit), Some(offset)) => format!(" LIMIT {} OFFSET {}", limit, offset),
        (None, Some(offset)) => match driver {
            DriverKind::Postgresql => format!(" OFFSET {}", offset),
            DriverKind::Mysql => format!(" LIMIT 18446744073709551615 OFFSET {}", offset),
            _ => format!(" LIMIT -1 OFFSET {}", offset),
        },
    }
}
