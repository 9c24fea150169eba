use ammonia;

/// Clean section heading text using the ammonia library.
///
/// Headings are user-supplied display text that ends up rendered in the
/// editor and in attempt navigation. Whitelist-based sanitization keeps
/// safe inline tags (like <b>) while stripping <script> and event-handler
/// attributes, so a heading can never carry Stored XSS into a client.
pub fn clean_html(input: &str) -> String {
    ammonia::clean(input)
}
