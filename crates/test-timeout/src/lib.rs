//! Test attributes for async peer-link tests.
//!
//! Each test runs on its own current-thread runtime inside a dedicated OS
//! thread, guarded by a wall-clock deadline so a stuck negotiation fails the
//! test instead of hanging the suite.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_TIMEOUT_SECS: u64 = 60;
/// Virtual-time budget for paused-clock tests; timers advance instantly.
const PAUSED_VIRTUAL_BUDGET_SECS: u64 = 3_600;

/// `#[tokio_timeout_test]` / `#[tokio_timeout_test(30)]`: real clock.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let timeout_secs = match parse_timeout(attr) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };
    let function = parse_macro_input!(item as ItemFn);
    expand(function, timeout_secs, false).into()
}

/// `#[paused_clock_test]` / `#[paused_clock_test(30)]`: the runtime starts
/// with tokio's clock paused, so sleeps and timeouts auto-advance whenever
/// every task is idle. The argument is still a wall-clock guard.
#[proc_macro_attribute]
pub fn paused_clock_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let timeout_secs = match parse_timeout(attr) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };
    let function = parse_macro_input!(item as ItemFn);
    expand(function, timeout_secs, true).into()
}

fn parse_timeout(attr: TokenStream) -> syn::Result<u64> {
    if attr.is_empty() {
        return Ok(DEFAULT_TIMEOUT_SECS);
    }
    let lit: LitInt = syn::parse(attr)?;
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
    }
    Ok(secs)
}

fn expand(function: ItemFn, timeout_secs: u64, paused: bool) -> TokenStream2 {
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = function;

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(&sig.ident, "test attribute expects an async function")
            .to_compile_error();
    }
    sig.asyncness = None;

    let filtered_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_tokio_test_attribute(attr))
        .collect();

    let inner_budget = if paused {
        PAUSED_VIRTUAL_BUDGET_SECS
    } else {
        timeout_secs
    };
    let builder = if paused {
        quote! {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .start_paused(true)
        }
    } else {
        quote! {
            tokio::runtime::Builder::new_current_thread().enable_all()
        }
    };

    quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            let wall_clock = std::time::Duration::from_secs(#timeout_secs);
            let budget = std::time::Duration::from_secs(#inner_budget);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let runtime = #builder
                        .build()
                        .expect("failed to build Tokio runtime");
                    runtime.block_on(async {
                        tokio::time::timeout(budget, async move #block)
                            .await
                            .expect("test timed out");
                    });
                }));
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(wall_clock) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    }
}

fn is_tokio_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None)
            if first.ident == "tokio" && second.ident == "test"
    )
}
