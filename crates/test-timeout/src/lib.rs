//! `#[tokio_timeout_test]`: an async test that fails instead of hanging.
//!
//! ```ignore
//! #[test_timeout::tokio_timeout_test(10)]
//! async fn dials_broker() { /* ... */ }
//!
//! #[test_timeout::tokio_timeout_test(secs = 30, flavor = "multi_thread")]
//! async fn many_clients() { /* ... */ }
//! ```
//!
//! The body runs on its own thread and runtime, so even a test that blocks
//! the runtime thread is reported as timed out.

use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::quote;
use syn::{
    parse::{Parse, ParseStream},
    parse_macro_input, Attribute, Ident, ItemFn, LitInt, LitStr, Token,
};

const DEFAULT_SECS: u64 = 60;

#[derive(Clone, Copy)]
enum Flavor {
    CurrentThread,
    MultiThread,
}

struct Options {
    secs: u64,
    flavor: Flavor,
}

impl Parse for Options {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut options = Options {
            secs: DEFAULT_SECS,
            flavor: Flavor::CurrentThread,
        };
        if input.is_empty() {
            return Ok(options);
        }
        if input.peek(LitInt) {
            options.secs = positive_secs(&input.parse::<LitInt>()?)?;
            return Ok(options);
        }
        while !input.is_empty() {
            let key: Ident = input.parse()?;
            input.parse::<Token![=]>()?;
            match key.to_string().as_str() {
                "secs" => options.secs = positive_secs(&input.parse::<LitInt>()?)?,
                "flavor" => {
                    let value: LitStr = input.parse()?;
                    options.flavor = match value.value().as_str() {
                        "current_thread" => Flavor::CurrentThread,
                        "multi_thread" => Flavor::MultiThread,
                        other => {
                            return Err(syn::Error::new(
                                value.span(),
                                format!("unknown runtime flavor `{other}`"),
                            ))
                        }
                    };
                }
                other => {
                    return Err(syn::Error::new(
                        key.span(),
                        format!("unknown option `{other}`; expected `secs` or `flavor`"),
                    ))
                }
            }
            if !input.is_empty() {
                input.parse::<Token![,]>()?;
            }
        }
        Ok(options)
    }
}

fn positive_secs(lit: &LitInt) -> syn::Result<u64> {
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new(lit.span(), "timeout must be greater than zero"));
    }
    Ok(secs)
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let options = parse_macro_input!(attr as Options);
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.take().is_none() {
        return syn::Error::new_spanned(&sig.ident, "tokio_timeout_test expects an async fn")
            .to_compile_error()
            .into();
    }
    let attrs: Vec<Attribute> = attrs.into_iter().filter(|attr| !is_tokio_test(attr)).collect();

    let secs = options.secs;
    let builder = match options.flavor {
        Flavor::CurrentThread => Ident::new("new_current_thread", Span::call_site()),
        Flavor::MultiThread => Ident::new("new_multi_thread", Span::call_site()),
    };

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let limit = ::std::time::Duration::from_secs(#secs);
            let (done, outcome) = ::std::sync::mpsc::channel();
            ::std::thread::spawn(move || {
                let result = ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(|| {
                    tokio::runtime::Builder::#builder()
                        .enable_all()
                        .build()
                        .expect("test runtime")
                        .block_on(async {
                            if tokio::time::timeout(limit, async move #block).await.is_err() {
                                panic!("test exceeded {}s", #secs);
                            }
                        });
                }));
                let _ = done.send(result);
            });
            match outcome.recv_timeout(limit + ::std::time::Duration::from_secs(1)) {
                Ok(Ok(())) => {}
                Ok(Err(panic)) => ::std::panic::resume_unwind(panic),
                Err(::std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test exceeded {}s and did not yield", #secs)
                }
                Err(::std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread exited without reporting")
                }
            }
        }
    })
}

/// Drops a stray `#[tokio::test]` so the test is not registered twice.
fn is_tokio_test(attr: &Attribute) -> bool {
    let segments: Vec<_> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    segments == ["tokio", "test"]
}
