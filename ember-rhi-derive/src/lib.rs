use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote, ToTokens};
use syn::spanned::Spanned;
use syn::{parse_macro_input, parse_quote, Data, DeriveInput, Expr, Fields, ItemStruct, Lit, LitStr, Meta, Type};

fn compile_error(span: impl Spanned, message: impl std::fmt::Display) -> TokenStream {
    syn::Error::new(span.span(), message).to_compile_error().into()
}

/// Inject the owning `ash::Device` into a Vulkan native object.
///
/// The struct gains a `pub(crate) device: ::ash::Device` field and implements the sealed
/// `crate::vulkan::device::DeviceObject` trait, so `Drop` impls can destroy their handles.
#[proc_macro_attribute]
#[allow(non_snake_case)]
pub fn DeviceObject(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let mut object = parse_macro_input!(item as ItemStruct);
    let fields = match &mut object.fields {
        Fields::Named(fields) => fields,
        _ => return compile_error(&object.ident, "DeviceObject needs a struct with named fields"),
    };
    if let Some(existing) = fields.named.iter().find(|field| field.ident.as_ref().is_some_and(|id| id == "device")) {
        return compile_error(existing, "DeviceObject injects `device` itself; remove this field");
    }
    fields.named.push(parse_quote!(pub(crate) device: ::ash::Device));

    let ident = &object.ident;
    let (impl_generics, ty_generics, where_clause) = object.generics.split_for_impl();
    quote! {
        #object

        impl #impl_generics crate::vulkan::device::sealed::Sealed for #ident #ty_generics #where_clause {}

        impl #impl_generics crate::vulkan::device::DeviceObject for #ident #ty_generics #where_clause {
            #[inline]
            fn device(&self) -> &::ash::Device { &self.device }
        }
    }
    .into()
}

/// Derive `ember_rhi::VertexLayout` for a `#[repr(C)]` vertex struct.
///
/// Every field becomes one attribute in declaration order. The semantic name is the upper-cased
/// field name unless overridden with `#[vertex(semantic = "TEXCOORD")]`.
#[proc_macro_derive(VertexLayout, attributes(vertex))]
pub fn derive_vertex_layout(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match vertex_layout(&input) {
        Ok(tokens) => tokens.into(),
        Err(error) => error.to_compile_error().into(),
    }
}

fn vertex_layout(input: &DeriveInput) -> syn::Result<TokenStream2> {
    if !is_repr_c(input) {
        return Err(syn::Error::new(
            input.ident.span(),
            "VertexLayout needs #[repr(C)] so field offsets are stable",
        ));
    }
    let Data::Struct(data) = &input.data else {
        return Err(syn::Error::new(input.ident.span(), "VertexLayout can only be derived for structs"));
    };
    let Fields::Named(fields) = &data.fields else {
        return Err(syn::Error::new(data.fields.span(), "VertexLayout needs named fields"));
    };

    let attributes = fields
        .named
        .iter()
        .enumerate()
        .map(|(location, field)| {
            let ident = field.ident.as_ref().ok_or_else(|| syn::Error::new(field.span(), "unnamed field"))?;
            let format = format_ident!("{}", pixel_format(&field.ty)?);
            let semantic = match semantic_override(field)? {
                Some(semantic) => semantic,
                None => ident.to_string().to_uppercase(),
            };
            let location = location as u32;
            Ok(quote! {
                ::ember_rhi::VertexAttribute {
                    semantic: ::std::borrow::Cow::Borrowed(#semantic),
                    semantic_index: 0,
                    location: #location,
                    binding: 0,
                    format: ::ember_rhi::PixelFormat::#format,
                    offset: ::ember_rhi::memoffset::offset_of!(Self, #ident) as u32,
                }
            })
        })
        .collect::<syn::Result<Vec<_>>>()?;

    let ident = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    Ok(quote! {
        impl #impl_generics ::ember_rhi::VertexLayout for #ident #ty_generics #where_clause {
            fn vertex_layout() -> ::ember_rhi::InputLayout {
                ::ember_rhi::InputLayout {
                    stride: ::core::mem::size_of::<Self>() as u32,
                    attributes: ::std::vec![#(#attributes),*],
                }
            }
        }
    })
}

fn is_repr_c(input: &DeriveInput) -> bool {
    input.attrs.iter().filter(|attr| attr.path().is_ident("repr")).any(|attr| {
        attr.parse_args_with(syn::punctuated::Punctuated::<Meta, syn::Token![,]>::parse_terminated)
            .map(|items| items.iter().any(|item| item.path().is_ident("C")))
            .unwrap_or(false)
    })
}

fn semantic_override(field: &syn::Field) -> syn::Result<Option<String>> {
    let mut semantic = None;
    for attr in field.attrs.iter().filter(|attr| attr.path().is_ident("vertex")) {
        attr.parse_nested_meta(|meta| {
            if !meta.path.is_ident("semantic") {
                return Err(meta.error("expected `semantic = \"...\"`"));
            }
            semantic = Some(meta.value()?.parse::<LitStr>()?.value());
            Ok(())
        })?;
    }
    Ok(semantic)
}

/// `PixelFormat` variant for a scalar or a `[scalar; N]` field.
fn pixel_format(ty: &Type) -> syn::Result<&'static str> {
    let (scalar, count) = match ty {
        Type::Array(array) => {
            let count = match &array.len {
                Expr::Lit(expr) => match &expr.lit {
                    Lit::Int(int) => int.base10_parse::<usize>()?,
                    _ => return Err(syn::Error::new(array.len.span(), "array length must be an integer literal")),
                },
                _ => return Err(syn::Error::new(array.len.span(), "array length must be an integer literal")),
            };
            (scalar_name(&array.elem)?, count)
        }
        _ => (scalar_name(ty)?, 1),
    };

    let format = match (scalar.as_str(), count) {
        ("f32", 1) => "R32Float",
        ("f32", 2) => "R32G32Float",
        ("f32", 3) => "R32G32B32Float",
        ("f32", 4) => "R32G32B32A32Float",
        ("u32", 1) => "R32Uint",
        ("u32", 2) => "R32G32Uint",
        ("u32", 3) => "R32G32B32Uint",
        ("u32", 4) => "R32G32B32A32Uint",
        ("i32", 1) => "R32Sint",
        ("i32", 2) => "R32G32Sint",
        ("i32", 3) => "R32G32B32Sint",
        ("i32", 4) => "R32G32B32A32Sint",
        ("u8", 4) => "R8G8B8A8Unorm",
        _ => {
            return Err(syn::Error::new(
                ty.span(),
                format!("no vertex format for `{}`; use f32, u32 or i32 (or arrays of 2 to 4), or [u8; 4]", ty.to_token_stream()),
            ));
        }
    };
    Ok(format)
}

fn scalar_name(ty: &Type) -> syn::Result<String> {
    match ty {
        Type::Path(path) if path.qself.is_none() => path
            .path
            .get_ident()
            .map(|ident| ident.to_string())
            .ok_or_else(|| syn::Error::new(ty.span(), "vertex fields must be primitives or arrays of primitives")),
        _ => Err(syn::Error::new(ty.span(), "vertex fields must be primitives or arrays of primitives")),
    }
}
