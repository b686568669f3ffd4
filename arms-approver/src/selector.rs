/// Represents ways to locate a DOM element
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Selector {
    /// CSS selector, possibly a comma-separated group
    Css(String),
    /// Select by element id
    Id(String),
    /// Select using an XPath expression
    XPath(String),
    /// Elements matching `scope` whose normalized text contains `text`
    Text { scope: String, text: String },
    /// Represents an invalid selector string, with a reason.
    Invalid(String),
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl From<&str> for Selector {
    fn from(s: &str) -> Self {
        let s = s.trim();
        match s {
            "" => Selector::Invalid("empty selector".to_string()),
            _ if s.starts_with("id:") => Selector::Id(s[3..].trim().to_string()),
            _ if s.starts_with("xpath:") => Selector::XPath(s[6..].trim().to_string()),
            _ if s.starts_with("//") || s.starts_with("(//") => Selector::XPath(s.to_string()),
            _ if s.starts_with("css:") => Selector::Css(s[4..].trim().to_string()),
            _ if s.starts_with("text:") => {
                // text:<scope>|<text> or text:<text>
                let rest = &s[5..];
                match rest.split_once('|') {
                    Some((scope, text)) => Selector::Text {
                        scope: scope.trim().to_string(),
                        text: text.trim().to_string(),
                    },
                    None => Selector::Text {
                        scope: "*".to_string(),
                        text: rest.trim().to_string(),
                    },
                }
            }
            // A bare "#name" is only an id when it is not a compound CSS selector.
            _ if s.starts_with('#')
                && s[1..]
                    .chars()
                    .all(|c| c.is_alphanumeric() || c == '_' || c == '-') =>
            {
                Selector::Id(s[1..].to_string())
            }
            _ => Selector::Css(s.to_string()),
        }
    }
}

impl From<String> for Selector {
    fn from(s: String) -> Self {
        Selector::from(s.as_str())
    }
}

impl Selector {
    /// A JavaScript expression evaluating to an array of matching elements
    /// in document order.
    pub fn to_js_list(&self) -> String {
        match self {
            Selector::Css(css) => {
                format!("Array.from(document.querySelectorAll({}))", js_string(css))
            }
            Selector::Id(id) => {
                format!("[document.getElementById({})].filter(Boolean)", js_string(id))
            }
            Selector::XPath(xpath) => format!(
                "(function(){{var r=document.evaluate({},document,null,XPathResult.ORDERED_NODE_SNAPSHOT_TYPE,null);var a=[];for(var i=0;i<r.snapshotLength;i++){{a.push(r.snapshotItem(i));}}return a;}})()",
                js_string(xpath)
            ),
            Selector::Text { scope, text } => format!(
                "Array.from(document.querySelectorAll({})).filter(function(el){{return (el.textContent||'').replace(/\\s+/g,' ').trim().indexOf({})!==-1;}})",
                js_string(scope),
                js_string(text)
            ),
            Selector::Invalid(_) => "[]".to_string(),
        }
    }
}

/// Quote a Rust string as a JavaScript string literal.
pub fn js_string(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}
