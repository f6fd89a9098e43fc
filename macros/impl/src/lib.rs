//! Procedural macro implementations for `qosim-macros`.

use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::quote;
use syn::{parse_macro_input, Ident, ItemFn, LitStr};

/// Levels accepted by [macro@test_traced].
const LEVELS: [&str; 5] = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR"];

/// Run a test function with a `tracing` subscriber that writes to the test output.
///
/// The maximum log level defaults to `DEBUG` and can be overridden with a string
/// literal: `#[test_traced("TRACE")]`.
///
/// # Example
///
/// ```rust,ignore
/// use qosim_macros::test_traced;
///
/// #[test_traced("INFO")]
/// fn test_with_logs() {
///     tracing::info!("visible in test output");
/// }
/// ```
#[proc_macro_attribute]
pub fn test_traced(attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as ItemFn);

    // Parse the requested level
    let level = if attr.is_empty() {
        LitStr::new("DEBUG", Span::call_site())
    } else {
        parse_macro_input!(attr as LitStr)
    };
    let name = level.value().to_uppercase();
    if !LEVELS.contains(&name.as_str()) {
        return syn::Error::new(
            level.span(),
            format!("invalid log level, expected one of {LEVELS:?}"),
        )
        .to_compile_error()
        .into();
    }
    let level = Ident::new(&name, level.span());

    // Wrap the body so the subscriber is only active for this test
    let attrs = input.attrs;
    let vis = input.vis;
    let sig = input.sig;
    let block = input.block;
    let expanded = quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let subscriber = ::qosim_macros::tracing_subscriber::fmt()
                .with_test_writer()
                .with_max_level(::qosim_macros::tracing::Level::#level)
                .with_line_number(true)
                .finish();
            let dispatch = ::qosim_macros::tracing::Dispatch::new(subscriber);
            ::qosim_macros::tracing::dispatcher::with_default(&dispatch, || #block)
        }
    };
    TokenStream::from(expanded)
}
