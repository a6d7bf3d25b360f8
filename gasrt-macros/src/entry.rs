//! Expansion of `#[gasrt::main]` and `#[gasrt::test]`.
//!
//! ```ignore
//! #[gasrt::test(flavor = "stealing", worker_threads = 2)]
//! fn sums() -> Result<(), JoinError> { .. }
//! ```
//!
//! becomes
//!
//! ```ignore
//! #[::core::prelude::v1::test]
//! fn sums() -> Result<(), JoinError> {
//!     let body = move || -> Result<(), JoinError> { .. };
//!     let runtime = gasrt::runtime::Builder::new_stealing()
//!         .worker_threads(2usize)
//!         .try_build()
//!         .expect("failed to build the gasrt runtime");
//!     runtime.block_on(body)
//! }
//! ```
use crate::parse::{EntryArgs, Flavor, is_test_attribute};
use proc_macro2::TokenStream;
use quote::{ToTokens, quote, quote_spanned};
use syn::{AttrStyle, ItemFn, ReturnType};

#[derive(Debug, Clone, Copy)]
pub(crate) enum Entry {
    Main,
    Test,
}

impl Entry {
    fn name(self) -> &'static str {
        match self {
            Entry::Main => "gasrt::main",
            Entry::Test => "gasrt::test",
        }
    }

    fn default_flavor(self) -> Flavor {
        match self {
            Entry::Main => Flavor::Stealing,
            Entry::Test => Flavor::Local,
        }
    }
}

#[derive(Debug)]
struct RuntimeArgs {
    flavor: Flavor,
    worker_threads: Option<usize>,
}

pub(crate) fn expand(entry: Entry, args: TokenStream, item: TokenStream) -> TokenStream {
    let input: ItemFn = match syn::parse2(item.clone()) {
        Ok(input) => input,
        Err(err) => return with_error(item, err),
    };

    match syn::parse2::<EntryArgs>(args).and_then(|args| check(entry, &input, args)) {
        Ok(runtime) => generate(entry, input, runtime),
        // Keep the function around so that the error is the only one reported.
        Err(err) => with_error(item, err),
    }
}

fn with_error(mut item: TokenStream, err: syn::Error) -> TokenStream {
    item.extend(err.into_compile_error());
    item
}

fn check(entry: Entry, input: &ItemFn, args: EntryArgs) -> syn::Result<RuntimeArgs> {
    if let Some(asyncness) = &input.sig.asyncness {
        return Err(syn::Error::new_spanned(
            asyncness,
            format!("`#[{}]` runs a plain function, remove `async`", entry.name()),
        ));
    }

    if !input.sig.inputs.is_empty() {
        return Err(syn::Error::new_spanned(
            &input.sig.inputs,
            format!("`#[{}]` functions cannot take arguments", entry.name()),
        ));
    }

    if let Entry::Test = entry
        && let Some(attr) = input.attrs.iter().find(|attr| is_test_attribute(attr))
    {
        return Err(syn::Error::new_spanned(
            attr,
            "`#[gasrt::test]` already marks the function as a test, remove this attribute",
        ));
    }

    let flavor = args.flavor.unwrap_or(entry.default_flavor());
    match (flavor, args.worker_threads) {
        (Flavor::Local, Some((_, span))) => Err(syn::Error::new(
            span,
            format!(
                "`worker_threads` needs pool threads, use `#[{}(flavor = \"stealing\")]`",
                entry.name()
            ),
        )),
        (_, worker_threads) => Ok(RuntimeArgs {
            flavor,
            worker_threads: worker_threads.map(|(n, _)| n),
        }),
    }
}

fn generate(entry: Entry, input: ItemFn, runtime: RuntimeArgs) -> TokenStream {
    let ItemFn {
        mut attrs,
        vis,
        sig,
        block,
    } = input;

    // Inner attributes of the body end up on the function itself.
    for attr in &mut attrs {
        attr.style = AttrStyle::Outer;
    }

    let test_attr = match entry {
        Entry::Test => quote! { #[::core::prelude::v1::test] },
        Entry::Main => TokenStream::new(),
    };

    let output = match &sig.output {
        ReturnType::Default => quote! { () },
        ReturnType::Type(_, ty) => ty.to_token_stream(),
    };

    let mut builder = match runtime.flavor {
        Flavor::Local => quote! { gasrt::runtime::Builder::new_local() },
        Flavor::Stealing => quote! { gasrt::runtime::Builder::new_stealing() },
    };

    if let Some(n) = runtime.worker_threads {
        builder = quote! { #builder.worker_threads(#n) };
    }

    // Output type mismatches are reported on the closing brace of the body.
    let run = quote_spanned! {block.brace_token.span.close()=>
        #[allow(clippy::expect_used)]
        let runtime = #builder
            .try_build()
            .expect("failed to build the gasrt runtime");
        runtime.block_on(body)
    };

    quote! {
        #test_attr
        #(#attrs)*
        #vis #sig {
            let body = move || -> #output #block;
            #run
        }
    }
}
