use proc_macro::{Delimiter, Group, TokenStream, TokenTree};

/// Parses the attribute arguments shared by `main` and `test`.
///
/// The only accepted argument is `backend = "<name>"`. Returns the path
/// of the matching `BackendKind` variant, if one was given.
pub(crate) fn parse_backend(attr: TokenStream) -> Result<Option<&'static str>, String> {
    let attr = attr.to_string();
    let mut backend = None;

    for part in attr.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        let Some(value) = part.strip_prefix("backend") else {
            return Err(format!("unknown argument `{part}`, expected `backend = \"...\"`"));
        };

        let value = value.trim_start().trim_start_matches('=').trim().trim_matches('"');
        backend = Some(match value {
            "epoll" => "::pulsus::BackendKind::Epoll",
            "poll" => "::pulsus::BackendKind::Poll",
            "virtual" => "::pulsus::BackendKind::Virtual",
            other => {
                return Err(format!(
                    "unknown backend `{other}`, expected one of: epoll, poll, virtual"
                ));
            }
        });
    }

    Ok(backend)
}

/// Removes the `async` keyword and returns the position of the function
/// body together with its source.
pub(crate) fn take_body(tokens: &mut Vec<TokenTree>) -> Option<(usize, String)> {
    if let Some(pos) = tokens
        .iter()
        .position(|t| matches!(t, TokenTree::Ident(id) if id.to_string() == "async"))
    {
        tokens.remove(pos);
    }

    let pos = tokens
        .iter()
        .rposition(|t| matches!(t, TokenTree::Group(g) if g.delimiter() == Delimiter::Brace))?;

    match &tokens[pos] {
        TokenTree::Group(g) => Some((pos, g.stream().to_string())),
        _ => None,
    }
}

/// Wraps `body` so it runs to completion on a freshly built driver.
pub(crate) fn driver_body(body: &str, backend: Option<&str>) -> Result<TokenStream, String> {
    let configure = match backend {
        Some(kind) => format!("builder.backend({kind})"),
        None => "builder".to_string(),
    };

    let block = format!(
        "{{
            let __pulsus_driver = ::pulsus::DriverBuilder::from_env()
                .and_then(|builder| {configure}.build())
                .expect(\"failed to start the pulsus driver\");
            __pulsus_driver
                .block_on(async move {{ {body} }})
                .expect(\"pulsus event loop failed\")
        }}"
    );

    block
        .parse()
        .map(|stream| TokenStream::from(TokenTree::Group(Group::new(Delimiter::Brace, stream))))
        .map_err(|err| format!("failed to expand body: {err}"))
}

pub(crate) fn compile_error(message: &str) -> TokenStream {
    format!("compile_error!({message:?});")
        .parse()
        .unwrap_or_default()
}
