use std::borrow::Cow;

/// Normalize a bind/listen address.
///
/// Docs and flags commonly use the shorthand `":PORT"` to mean "bind on all
/// interfaces". Rust's `SocketAddr` parsing and Tokio bind APIs do not accept
/// `":PORT"`, so we normalize it to `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Appends `default_port` to an endpoint written without one. IPv6 literals
/// are expected in bracket form.
pub fn ensure_port(addr: &str, default_port: u16) -> String {
    let s = addr.trim();
    let after_brackets = match s.rfind(']') {
        Some(pos) => &s[pos + 1..],
        None => s,
    };
    if after_brackets.contains(':') {
        s.to_string()
    } else {
        format!("{s}:{default_port}")
    }
}
