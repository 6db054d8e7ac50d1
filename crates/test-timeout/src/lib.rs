//! Test attributes that fail a test once it exceeds a wall-clock budget.
//!
//! Socket-driven tests hang forever when a frame never arrives; wrapping them
//! in a watchdog thread turns that hang into a normal test failure.
//!
//! ```ignore
//! #[test_timeout::tokio_timeout_test]
//! async fn uses_the_default_budget() {}
//!
//! #[test_timeout::tokio_timeout_test(10)]
//! async fn ten_seconds() {}
//!
//! #[test_timeout::tokio_timeout_test(secs = 5, flavor = "multi_thread")]
//! async fn on_a_worker_pool() {}
//!
//! #[test_timeout::timeout(2)]
//! fn synchronous() {}
//! ```

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{
    parse::{Parse, ParseStream},
    parse_macro_input,
    punctuated::Punctuated,
    Attribute, Expr, ExprLit, ItemFn, Lit, LitInt, MetaNameValue, Token,
};

const DEFAULT_TIMEOUT_SECS: u64 = 60;
const MULTI_THREAD_WORKERS: usize = 2;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Flavor {
    CurrentThread,
    MultiThread,
}

struct TimeoutArgs {
    secs: u64,
    flavor: Flavor,
}

impl Default for TimeoutArgs {
    fn default() -> Self {
        Self {
            secs: DEFAULT_TIMEOUT_SECS,
            flavor: Flavor::CurrentThread,
        }
    }
}

impl Parse for TimeoutArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut args = TimeoutArgs::default();
        if input.is_empty() {
            return Ok(args);
        }

        if input.peek(LitInt) {
            let lit: LitInt = input.parse()?;
            args.secs = parse_secs(&lit)?;
            return Ok(args);
        }

        let pairs = Punctuated::<MetaNameValue, Token![,]>::parse_terminated(input)?;
        for pair in pairs {
            let Expr::Lit(ExprLit { lit, .. }) = &pair.value else {
                return Err(syn::Error::new_spanned(&pair.value, "expected a literal"));
            };
            if pair.path.is_ident("secs") {
                let Lit::Int(int) = lit else {
                    return Err(syn::Error::new_spanned(lit, "`secs` expects an integer"));
                };
                args.secs = parse_secs(int)?;
            } else if pair.path.is_ident("flavor") {
                let Lit::Str(text) = lit else {
                    return Err(syn::Error::new_spanned(lit, "`flavor` expects a string"));
                };
                args.flavor = match text.value().as_str() {
                    "current_thread" => Flavor::CurrentThread,
                    "multi_thread" => Flavor::MultiThread,
                    other => {
                        return Err(syn::Error::new_spanned(
                            text,
                            format!("unknown runtime flavor `{other}`"),
                        ))
                    }
                };
            } else {
                return Err(syn::Error::new_spanned(
                    &pair.path,
                    "expected `secs` or `flavor`",
                ));
            }
        }

        Ok(args)
    }
}

fn parse_secs(lit: &LitInt) -> syn::Result<u64> {
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(
            lit,
            "timeout must be greater than zero",
        ));
    }
    Ok(secs)
}

/// Runs an `async fn` test on a fresh Tokio runtime and fails it when it
/// outlives its budget (60 seconds unless given).
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as TimeoutArgs);
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let attrs = strip_attributes(attrs, is_tokio_test_attribute);
    let secs = args.secs;
    let runtime = match args.flavor {
        Flavor::CurrentThread => quote! { tokio::runtime::Builder::new_current_thread() },
        Flavor::MultiThread => {
            let workers = MULTI_THREAD_WORKERS;
            quote! {
                tokio::runtime::Builder::new_multi_thread().worker_threads(#workers)
            }
        }
    };

    let body = quote! {
        let runtime = #runtime
            .enable_all()
            .build()
            .expect("failed to build Tokio runtime");
        runtime.block_on(async {
            tokio::time::timeout(timeout_duration, async move #block)
                .await
                .expect("test timed out");
        });
    };

    watchdog(attrs, vis, sig, secs, body).into()
}

/// Runs a synchronous test on a watchdog thread and fails it when it outlives
/// its budget (60 seconds unless given).
#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as TimeoutArgs);
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "timeout attribute expects a synchronous test function",
        )
        .to_compile_error()
        .into();
    }
    if args.flavor != Flavor::CurrentThread {
        return syn::Error::new_spanned(
            &sig.ident,
            "`flavor` only applies to tokio_timeout_test",
        )
        .to_compile_error()
        .into();
    }

    let attrs = strip_attributes(attrs, is_test_attribute);
    let body = quote! {
        let _ = timeout_duration;
        (|| #block)();
    };

    watchdog(attrs, vis, sig, args.secs, body).into()
}

fn watchdog(
    attrs: Vec<Attribute>,
    vis: syn::Visibility,
    sig: syn::Signature,
    secs: u64,
    body: TokenStream2,
) -> TokenStream2 {
    quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let timeout_duration = std::time::Duration::from_secs(#secs);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    #body
                }));
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(timeout_duration) {
                Ok(Ok(())) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test timed out after {} seconds", #secs)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    }
}

fn strip_attributes(attrs: Vec<Attribute>, drop: fn(&Attribute) -> bool) -> Vec<Attribute> {
    attrs.into_iter().filter(|attr| !drop(attr)).collect()
}

fn is_tokio_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None)
            if first.ident == "tokio" && second.ident == "test"
    )
}

fn is_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!((segments.next(), segments.next()), (Some(first), None) if first.ident == "test")
}
