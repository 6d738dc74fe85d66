//! Minimal HTML served by the login controller.

use std::fmt::Write as _;

use super::InfoResponse;

/// Answer to a completed code flow; closes the login popup.
pub const CLOSE_WINDOW: &str = "<script>window.close();</script>";

const STYLE: &str = r"
        body {
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
            display: flex;
            justify-content: center;
            align-items: center;
            height: 100vh;
            margin: 0;
            background: #f4f5f7;
        }
        .container {
            min-width: 18rem;
            padding: 2rem;
            background: white;
            border-radius: 12px;
            box-shadow: 0 2px 12px rgba(0,0,0,0.08);
        }
        h1 { margin: 0 0 1rem 0; font-size: 1.5rem; }
        a.provider {
            display: block;
            margin: 0.5rem 0;
            padding: 0.6rem 1rem;
            border-radius: 8px;
            background: #3b5bdb;
            color: white;
            text-decoration: none;
        }
        p.password { margin: 0.5rem 0; color: #555; }
";

/// Provider list for browsers reaching the login entry without a session.
pub fn login_page(info: &InfoResponse) -> String {
    let mut items = String::new();
    for link in &info.provider.code {
        let _ = writeln!(
            items,
            r#"        <a class="provider" href="{}">{}</a>"#,
            escape(&link.url),
            escape(&link.name)
        );
    }
    for link in &info.provider.password {
        let _ = writeln!(
            items,
            r#"        <p class="password">{} (POST username and password to <code>{}</code>)</p>"#,
            escape(&link.name),
            escape(&link.url)
        );
    }

    let title = escape(&info.title);
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>{title}</title>
    <style>{STYLE}</style>
</head>
<body>
    <div class="container">
        <h1>{title}</h1>
{items}    </div>
</body>
</html>"#
    )
}

/// Popup status page: tells the parent window whether `cookie` is set.
pub fn status_page(cookie: &str, present: bool) -> String {
    let name = escape(cookie);
    let name_js = serde_json::to_string(cookie).unwrap_or_else(|_| "\"\"".to_string());
    format!(
        r#"<!DOCTYPE html>
<html>
<head><title>Login status</title></head>
<body data-cookie="{name}" data-present="{present}">
<script>
    var name = {name_js};
    var present = document.cookie.split("; ").some(function (c) {{ return c.indexOf(name + "=") === 0; }});
    if (window.parent && window.parent !== window) {{
        window.parent.postMessage({{ cookie: name, present: present }}, "*");
    }}
</script>
</body>
</html>"#
    )
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
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
