use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, DeriveInput};

/// Derives `FromParam` for a `String` newtype used in route paths, accepting
/// only the characters that appear in the identifiers the service hands out
/// (pilot stamps, storage names): ASCII alphanumerics plus `-`, `_` and `.`.
#[proc_macro_derive(IdFromParam)]
pub fn derive_id_from_param(input: TokenStream) -> TokenStream {
    let ast = parse_macro_input!(input as DeriveInput);
    from_param_impl(
        &ast,
        quote! {
            if !param.is_empty()
                && param.bytes().all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
            {
                Ok(Self(param.to_string()))
            } else {
                Err(param)
            }
        },
    )
}

/// Derives `FromParam` for an `i64` newtype (database assigned identifiers).
#[proc_macro_derive(NumberFromParam)]
pub fn derive_number_from_param(input: TokenStream) -> TokenStream {
    let ast = parse_macro_input!(input as DeriveInput);
    from_param_impl(
        &ast,
        quote! {
            param.parse::<i64>().map(Self).map_err(|_| param)
        },
    )
}

/// Both derives share the same impl skeleton; the rejected parameter is the
/// error, so routes can forward it to a catcher unchanged.
fn from_param_impl(ast: &DeriveInput, body: proc_macro2::TokenStream) -> TokenStream {
    let name = &ast.ident;
    quote! {
        #[automatically_derived]
        impl<'r> rocket::request::FromParam<'r> for #name {
            type Error = &'r str;

            fn from_param(param: &'r str) -> Result<Self, Self::Error> {
                #body
            }
        }
    }
    .into()
}
