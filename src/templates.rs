//! HTML pages served by the authorization server and the loopback listener.
//!
//! Every value interpolated into a page goes through [`escape_html`].

/// Escapes the five HTML-significant characters.
///
/// # Examples
///
/// ```
/// use gatehouse::templates::escape_html;
///
/// assert_eq!(escape_html("<b>\"x\" & 'y'</b>"), "&lt;b&gt;&quot;x&quot; &amp; &#39;y&#39;&lt;/b&gt;");
/// ```
pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn page(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>{title}</title>\n\
         <style>body {{ font-family: sans-serif; max-width: 480px; margin: 60px auto; }} \
         .error {{ color: #b00020; }} button {{ margin-right: 8px; }}</style>\n\
         </head>\n<body>\n{body}\n</body>\n</html>\n",
        title = escape_html(title),
        body = body
    )
}

/// Login challenge for a pending authorization request.
///
/// `message` is shown above the form, typically after a failed attempt.
pub fn login_page(state: &str, client_name: &str, scope: &str, message: Option<&str>) -> String {
    let notice = message
        .map(|m| format!("<p class=\"error\">{}</p>", escape_html(m)))
        .unwrap_or_default();
    let body = format!(
        "<h2>Sign in</h2>\n\
         <p><strong>{client}</strong> is requesting access with scope <code>{scope}</code>.</p>\n\
         {notice}\n\
         <form action=\"/login/callback\" method=\"post\">\n\
         <input type=\"hidden\" name=\"state\" value=\"{state}\">\n\
         <p><label>Username <input type=\"text\" name=\"username\" autocomplete=\"username\"></label></p>\n\
         <p><label>Password <input type=\"password\" name=\"password\" autocomplete=\"current-password\"></label></p>\n\
         <button type=\"submit\" name=\"action\" value=\"approve\">Approve</button>\
         <button type=\"submit\" name=\"action\" value=\"deny\">Deny</button>\n\
         </form>",
        client = escape_html(client_name),
        scope = escape_html(scope),
        notice = notice,
        state = escape_html(state),
    );
    page("Sign in", &body)
}

/// Shown by the loopback listener once a code arrived.
pub fn callback_success_page() -> String {
    page(
        "Authorization complete",
        "<h2>Authorization successful</h2>\n\
         <p>You can close this window and return to the terminal.</p>",
    )
}

/// Shown by the loopback listener when the redirect carried an error.
pub fn callback_error_page(error: &str) -> String {
    page(
        "Authorization failed",
        &format!(
            "<h2 class=\"error\">Authorization failed</h2>\n<p>Error: {}</p>\n\
             <p>You can close this window and return to the terminal.</p>",
            escape_html(error)
        ),
    )
}

/// Generic error page used by the authorization server when it must not
/// redirect (unknown client, unregistered redirect URI, expired request).
pub fn error_page(title: &str, detail: &str) -> String {
    page(
        title,
        &format!(
            "<h2 class=\"error\">{}</h2>\n<p>{}</p>",
            escape_html(title),
            escape_html(detail)
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_page_escapes_state_and_client() {
        let html = login_page("a\"><script>", "<evil>", "user", None);
        assert!(!html.contains("<script>"));
        assert!(!html.contains("<evil>"));
        assert!(html.contains("a&quot;&gt;&lt;script&gt;"));
    }

    #[test]
    fn test_login_page_shows_message() {
        let html = login_page("s", "client", "user", Some("Invalid credentials"));
        assert!(html.contains("Invalid credentials"));
        assert!(html.contains("value=\"approve\""));
        assert!(html.contains("value=\"deny\""));
    }

    #[test]
    fn test_callback_error_page_escapes_error() {
        let html = callback_error_page("<img src=x>");
        assert!(html.contains("&lt;img src=x&gt;"));
    }

    #[test]
    fn test_success_page_mentions_terminal() {
        assert!(callback_success_page().contains("return to the terminal"));
    }
}
