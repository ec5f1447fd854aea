//! Page shown in the browser tab that the OAuth redirect lands on.

const TEMPLATE: &str = include_str!("../builtins/oauth-callback.html");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OAuthCallbackVariant {
    Success,
    Error,
}

impl OAuthCallbackVariant {
    /// CSS variables for the light and dark accent colors.
    fn accents(self) -> (&'static str, &'static str) {
        match self {
            OAuthCallbackVariant::Success => ("var(--success-light)", "var(--success-dark)"),
            OAuthCallbackVariant::Error => ("var(--error-light)", "var(--error-dark)"),
        }
    }
}

pub fn render_oauth_callback_page(
    title: &str,
    heading: &str,
    detail: &str,
    variant: OAuthCallbackVariant,
) -> String {
    let (light, dark) = variant.accents();
    [
        ("{{TITLE}}", escape_html(title)),
        ("{{HEADING}}", escape_html(heading)),
        ("{{DETAIL}}", escape_html(detail)),
        ("{{ACCENT_COLOR_LIGHT}}", light.to_string()),
        ("{{ACCENT_COLOR_DARK}}", dark.to_string()),
    ]
    .iter()
    .fold(TEMPLATE.to_string(), |page, (placeholder, value)| {
        page.replace(placeholder, value)
    })
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_page_uses_success_accent() {
        let page = render_oauth_callback_page(
            "toolrelay OAuth",
            "You're authorized",
            "Close this tab and return to toolrelay.",
            OAuthCallbackVariant::Success,
        );
        assert!(page.contains("<h1>You&#39;re authorized</h1>"));
        assert!(page.contains("<title>toolrelay OAuth</title>"));
        assert!(page.contains("--accent: var(--success-light);"));
        assert!(page.contains("--accent: var(--success-dark);"));
        assert!(!page.contains("{{"));
    }

    #[test]
    fn text_is_escaped_before_substitution() {
        let page = render_oauth_callback_page(
            "<t>",
            "Failed",
            "\"state\" & <script>",
            OAuthCallbackVariant::Error,
        );
        assert!(page.contains("<title>&lt;t&gt;</title>"));
        assert!(page.contains("&quot;state&quot; &amp; &lt;script&gt;"));
        assert!(page.contains("var(--error-light)"));
    }
}
