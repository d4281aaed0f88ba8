// sqlbridge-core/src/naming.rs
//! Exported symbol names for managed native methods
//!
//! The runtime binds a `native` method to the symbol
//! `Java_<mangled class>_<mangled method>`. Mangling escapes `_` as `_1`,
//! `;` as `_2`, `[` as `_3`, any non-alphanumeric character as `_0xxxx`
//! (UTF-16 code unit, lowercase hex) and turns `/` into `_`.

/// Mangle one component (class path or method name)
pub fn mangle(component: &str) -> String {
    let mut out = String::with_capacity(component.len() + 8);
    for ch in component.chars() {
        match ch {
            '/' | '.' => out.push('_'),
            '_' => out.push_str("_1"),
            ';' => out.push_str("_2"),
            '[' => out.push_str("_3"),
            c if c.is_ascii_alphanumeric() => out.push(c),
            c => {
                let mut units = [0u16; 2];
                for unit in c.encode_utf16(&mut units) {
                    out.push_str(&format!("_0{:04x}", unit));
                }
            }
        }
    }
    out
}

/// Full symbol for `class` (slash-separated) and `method`
pub fn jni_symbol(class: &str, method: &str) -> String {
    format!("Java_{}_{}", mangle(class), mangle(method))
}
