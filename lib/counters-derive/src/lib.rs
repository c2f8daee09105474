// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

extern crate proc_macro;
use proc_macro::TokenStream;
use quote::{quote, ToTokens};
use syn::{parse_macro_input, DeriveInput};

/// Derives an implementation of `counters::Count` for the annotated `enum`
/// type: one `AtomicU32` field per unit/tuple/struct variant, incremented
/// (relaxed) whenever a value of that variant is counted.
///
/// This is a trimmed version of the teacher kernel's `counters-derive`: it
/// drops the `#[count(skip)]` / `#[count(children)]` attributes, which exist
/// there to squeeze counters into a few bytes of `no_std` RAM. A hosted
/// runtime has no such pressure, so every variant gets a counter.
#[proc_macro_derive(Count)]
pub fn derive_count(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match gen_count_impl(input) {
        Ok(tokens) => tokens.to_token_stream().into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn gen_count_impl(input: DeriveInput) -> Result<impl ToTokens, syn::Error> {
    let data_enum = match &input.data {
        syn::Data::Enum(data_enum) => data_enum,
        _ => {
            return Err(syn::Error::new_spanned(
                &input,
                "`Count` can only be derived for enums",
            ))
        }
    };

    let enum_name = &input.ident;
    let vis = &input.vis;
    let counts_ty =
        quote::format_ident!("{}Counts", enum_name, span = enum_name.span());

    let mut field_defs = Vec::new();
    let mut field_inits = Vec::new();
    let mut arms = Vec::new();

    for variant in &data_enum.variants {
        let variant_name = &variant.ident;
        field_defs.push(quote! { pub #variant_name: core::sync::atomic::AtomicU32 });
        field_inits.push(quote! { #variant_name: core::sync::atomic::AtomicU32::new(0) });
        let pattern = match &variant.fields {
            syn::Fields::Unit => quote! { #enum_name::#variant_name },
            syn::Fields::Unnamed(_) => quote! { #enum_name::#variant_name(..) },
            syn::Fields::Named(_) => quote! { #enum_name::#variant_name { .. } },
        };
        arms.push(quote! {
            #pattern => {
                counters.#variant_name.fetch_add(1, core::sync::atomic::Ordering::Relaxed);
            }
        });
    }

    Ok(quote! {
        #[doc = concat!("Per-variant counts for [`", stringify!(#enum_name), "`].")]
        #[allow(non_snake_case)]
        #vis struct #counts_ty {
            #(#field_defs),*
        }

        #[automatically_derived]
        impl counters::Count for #enum_name {
            type Counters = #counts_ty;

            const NEW_COUNTERS: #counts_ty = #counts_ty {
                #(#field_inits),*
            };

            fn count(&self, counters: &Self::Counters) {
                match self {
                    #(#arms),*
                }
            }
        }
    })
}
