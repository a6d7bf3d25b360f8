use proc_macro2::Span;
use syn::parse::{Parse, ParseStream};
use syn::punctuated::Punctuated;
use syn::{Attribute, Expr, ExprLit, Lit, MetaNameValue, Token};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flavor {
    Local,
    Stealing,
}

impl Flavor {
    fn from_lit(lit: &Lit) -> syn::Result<Self> {
        let Lit::Str(name) = lit else {
            return Err(syn::Error::new(
                lit.span(),
                "`flavor` expects a string: \"local\" or \"stealing\"",
            ));
        };

        match name.value().as_str() {
            "local" => Ok(Flavor::Local),
            "stealing" => Ok(Flavor::Stealing),
            other => Err(syn::Error::new(
                name.span(),
                format!("unknown flavor `{other}`, expected \"local\" or \"stealing\""),
            )),
        }
    }
}

fn worker_threads_from_lit(lit: &Lit) -> syn::Result<usize> {
    let Lit::Int(n) = lit else {
        return Err(syn::Error::new(lit.span(), "`worker_threads` expects an integer"));
    };

    match n.base10_parse::<usize>()? {
        0 => Err(syn::Error::new(n.span(), "`worker_threads` must be at least 1")),
        n => Ok(n),
    }
}

/// Attribute arguments, e.g. `flavor = "stealing", worker_threads = 4`.
#[derive(Debug, Default)]
pub(crate) struct EntryArgs {
    pub(crate) flavor: Option<Flavor>,

    /// Span kept to point at it when the flavor does not allow it.
    pub(crate) worker_threads: Option<(usize, Span)>,
}

impl Parse for EntryArgs {
    fn parse(input: ParseStream<'_>) -> syn::Result<Self> {
        let mut args = EntryArgs::default();

        for arg in Punctuated::<MetaNameValue, Token![,]>::parse_terminated(input)? {
            let key = match arg.path.get_ident() {
                Some(ident) => ident.to_string(),
                None => {
                    return Err(syn::Error::new_spanned(
                        &arg.path,
                        "expected `flavor` or `worker_threads`",
                    ));
                }
            };

            let Expr::Lit(ExprLit { lit, .. }) = &arg.value else {
                return Err(syn::Error::new_spanned(
                    &arg.value,
                    format!("`{key}` expects a literal"),
                ));
            };

            let duplicate = || syn::Error::new_spanned(&arg, format!("`{key}` is set twice"));

            match key.as_str() {
                "flavor" if args.flavor.is_some() => return Err(duplicate()),
                "flavor" => args.flavor = Some(Flavor::from_lit(lit)?),
                "worker_threads" if args.worker_threads.is_some() => return Err(duplicate()),
                "worker_threads" => {
                    args.worker_threads = Some((worker_threads_from_lit(lit)?, lit.span()));
                }
                _ => {
                    return Err(syn::Error::new_spanned(
                        &arg.path,
                        format!("unknown argument `{key}`, expected `flavor` or `worker_threads`"),
                    ));
                }
            }
        }

        Ok(args)
    }
}

/// Matches the built-in test attribute, `#[test]` or one of its prelude
/// paths such as `#[::core::prelude::v1::test]`.
pub(crate) fn is_test_attribute(attr: &Attribute) -> bool {
    let syn::Meta::Path(path) = &attr.meta else {
        return false;
    };

    let idents = path
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect::<Vec<_>>();

    matches!(
        idents.iter().map(String::as_str).collect::<Vec<_>>().as_slice(),
        ["test"] | ["core" | "std", "prelude", _, "test"]
    )
}
