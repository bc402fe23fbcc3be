pub mod libraries;
pub mod modules;
pub mod selftest;

/// `0x`-prefixed address, padded to pointer width.
pub(crate) fn format_address(addr: usize) -> String {
    format!("{:#018x}", addr)
}
