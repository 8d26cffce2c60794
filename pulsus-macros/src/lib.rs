//! Attribute macros for running async entry points on a Pulsus driver.

mod utils;

use proc_macro::{TokenStream, TokenTree};

/// Runs an `async fn main` to completion on a new driver.
///
/// The driver is configured from the environment. An explicit backend
/// can be requested with `#[pulsus::main(backend = "poll")]`.
#[proc_macro_attribute]
pub fn main(attr: TokenStream, item: TokenStream) -> TokenStream {
    expand(attr, item, false)
}

/// Like [`main`], for `async` test functions.
#[proc_macro_attribute]
pub fn test(attr: TokenStream, item: TokenStream) -> TokenStream {
    expand(attr, item, true)
}

fn expand(attr: TokenStream, item: TokenStream, test: bool) -> TokenStream {
    let backend = match utils::parse_backend(attr) {
        Ok(backend) => backend,
        Err(message) => return utils::compile_error(&message),
    };

    let mut tokens: Vec<TokenTree> = item.into_iter().collect();

    let Some((pos, body)) = utils::take_body(&mut tokens) else {
        return utils::compile_error("expected a function with a body");
    };

    let new_body = match utils::driver_body(&body, backend) {
        Ok(body) => body,
        Err(message) => return utils::compile_error(&message),
    };

    tokens.splice(pos..=pos, new_body);

    let mut result: Vec<TokenTree> = Vec::new();
    if test {
        let test_attr: TokenStream = "#[test]".parse().unwrap_or_default();
        result.extend(test_attr);
    }
    result.extend(tokens);

    result.into_iter().collect()
}
