extern crate proc_macro;

use proc_macro::TokenStream;
use proc_macro_error::{abort, proc_macro_error};
use quote::quote;
use syn::parse_macro_input;
use syn::punctuated::Punctuated;
use syn::spanned::Spanned;

fn type_name(ty: &syn::Type) -> Option<String> {
    match ty {
        syn::Type::Path(syn::TypePath { qself: None, path }) => {
            path.segments.last().map(|seg| seg.ident.to_string())
        }
        _ => None,
    }
}

fn check_exec_fn(items: &[syn::ImplItem], am_name: &str) {
    let exec = items.iter().find_map(|item| match item {
        syn::ImplItem::Fn(f) if f.sig.ident == "exec" => Some(f),
        _ => None,
    });
    match exec {
        Some(f) => {
            if f.sig.asyncness.is_some() {
                abort!(
                    f.sig.fn_token.span(),
                    "regionq active messages execute inline on the owning pe, `exec` must not be async"
                );
            }
        }
        None => abort!(
            proc_macro2::Span::call_site(),
            "impl ActiveMessage for {} is missing the `exec` function",
            am_name
        ),
    }
}

fn parse_am(input: TokenStream, regionq: proc_macro2::TokenStream, rt: bool) -> TokenStream {
    let input: syn::ItemImpl = match syn::parse(input) {
        Ok(input) => input,
        Err(err) => abort!(err.span(), "#[am] expects an `impl ActiveMessage for T` block"),
    };

    match &input.trait_ {
        Some((_, path, _)) => {
            let is_am = path
                .segments
                .last()
                .map(|seg| seg.ident == "ActiveMessage")
                .unwrap_or(false);
            if !is_am {
                abort!(path.span(), "#[am] must annotate an `impl ActiveMessage for T` block");
            }
        }
        None => abort!(
            input.self_ty.span(),
            "#[am] must annotate an `impl ActiveMessage for T` block"
        ),
    }

    if !input.generics.params.is_empty() {
        abort!(
            input.generics.span(),
            "generic active messages cannot be registered, register each concrete type instead"
        );
    }

    let am_ty = &input.self_ty;
    let am_name = match type_name(am_ty) {
        Some(name) => name,
        None => abort!(am_ty.span(), "unsupported active message type"),
    };
    check_exec_fn(&input.items, &am_name);

    let registration = quote! {
        impl #regionq::active_messaging::RemoteActiveMessage for #am_ty {
            const AM_NAME: &'static str = concat!(module_path!(), "::", stringify!(#am_ty));
        }

        #regionq::inventory::submit! {
            #regionq::active_messaging::RegisteredAm {
                name: <#am_ty as #regionq::active_messaging::RemoteActiveMessage>::AM_NAME,
                exec: #regionq::active_messaging::exec_am::<#am_ty>,
            }
        }
    };

    let output = if rt {
        quote! {
            #input
            #registration
        }
    } else {
        quote! {
            #input
            const _: () = {
                extern crate regionq as __regionq;
                #registration
            };
        }
    };
    TokenStream::from(output)
}

/// Registers an active message so it can be invoked on remote PEs.
///
/// Annotates an `impl ActiveMessage for T` block. The macro assigns the type a unique
/// name (module path + type name) and submits its unpack/execute function to the
/// runtime registry, which every PE of the same binary sorts identically to derive
/// the id carried on the wire.
///
///```ignore
/// use regionq::{ActiveMessage, AmContext};
///
/// #[regionq::AmData(Debug, Clone)]
/// struct Square {
///     x: u64,
/// }
///
/// #[regionq::am]
/// impl ActiveMessage for Square {
///     type Output = u64;
///     fn exec(self, _ctx: &AmContext) -> u64 {
///         self.x * self.x
///     }
/// }
///```
#[proc_macro_error]
#[proc_macro_attribute]
pub fn am(_args: TokenStream, input: TokenStream) -> TokenStream {
    parse_am(input, quote! {__regionq}, false)
}

#[doc(hidden)]
#[proc_macro_error]
#[proc_macro_attribute]
pub fn rt_am(_args: TokenStream, input: TokenStream) -> TokenStream {
    parse_am(input, quote! {crate}, true)
}

/// Derives the serde traits an active message (or any data moved between PEs) needs,
/// alongside any additional derivable traits passed as arguments.
///
///```ignore
/// #[regionq::AmData(Debug, Clone, PartialEq)]
/// struct Payload {
///     values: Vec<f64>,
/// }
///```
#[allow(non_snake_case)]
#[proc_macro_error]
#[proc_macro_attribute]
pub fn AmData(args: TokenStream, input: TokenStream) -> TokenStream {
    let args = parse_macro_input!(args with Punctuated<syn::Path, syn::Token![,]>::parse_terminated);
    let input = parse_macro_input!(input as syn::DeriveInput);
    let traits = args.iter();
    let output = quote! {
        #[derive(regionq::serde::Serialize, regionq::serde::Deserialize, #(#traits),*)]
        #[serde(crate = "regionq::serde")]
        #input
    };
    TokenStream::from(output)
}
