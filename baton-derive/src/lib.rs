use proc_macro::TokenStream;
use proc_macro_crate::{FoundCrate, crate_name};
use quote::quote;
use syn::{
    Attribute, Data, DeriveInput, Error, Fields, GenericArgument, Ident, PathArguments, ReturnType,
    Type, TypePath, parse_macro_input, spanned::Spanned,
};

/// Derive macro for the `SharedMemorySafe` marker trait.
///
/// A type that lives in a region mapped by several processes must keep the
/// same layout in every mapping and must not smuggle in process-local
/// addresses. The macro checks what it can at compile time:
///
/// 1. **Stable layout**: the item carries `#[repr(C)]`, `#[repr(transparent)]`
///    or an integer repr (enums).
/// 2. **No address-carrying fields**: references, raw pointers and the usual
///    heap owners (`Vec`, `Box`, `String`, `Rc`, `Arc`, ...) are rejected by
///    name, as are `std::sync` primitives, which only work inside one
///    process.
/// 3. **Recursive safety**: every field type must itself be
///    `SharedMemorySafe`, enforced through generated where clauses.
///
/// The impl is still `unsafe` underneath because the remaining obligations
/// are semantic: concurrent access must go through atomics or the crate's
/// process-shared locks, and nothing may rely on `Drop` running (a crashed
/// peer skips destructors).
///
/// # Example
///
/// ```
/// # use baton::SharedMemorySafe;
/// use std::sync::atomic::{AtomicBool, AtomicU64};
///
/// #[derive(SharedMemorySafe)]
/// #[repr(C)]
/// struct Header {
///     generation: AtomicU64,
///     sealed: AtomicBool,
///     payload: [u8; 64],
/// }
/// ```
///
/// # Compile errors
///
/// ```compile_fail
/// # use baton::SharedMemorySafe;
/// #[derive(SharedMemorySafe)]
/// struct NoRepr {  // missing #[repr(C)]
///     x: u32,
/// }
/// ```
///
/// ```compile_fail
/// # use baton::SharedMemorySafe;
/// use std::sync::Mutex;
///
/// #[derive(SharedMemorySafe)]
/// #[repr(C)]
/// struct LocalLock {
///     guarded: Mutex<u64>,  // process-local; use ShmMutex
/// }
/// ```
#[proc_macro_derive(SharedMemorySafe)]
pub fn derive_shared_memory_safe(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    match expand(input) {
        Ok(tokens) => tokens,
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand(input: DeriveInput) -> syn::Result<TokenStream> {
    require_stable_repr(&input)?;

    let fields = field_types(&input.data)?;
    for ty in &fields {
        reject_address_carriers(ty)?;
    }

    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    let host = host_crate_path();

    let mut predicates = where_clause
        .map(|w| w.predicates.iter().cloned().collect::<Vec<_>>())
        .unwrap_or_default();
    for ty in &fields {
        predicates.push(syn::parse_quote! {
            #ty: #host::__SharedMemorySafePrivate
        });
    }

    let expanded = if predicates.is_empty() {
        quote! {
            unsafe impl #impl_generics #host::__SharedMemorySafePrivate for #name #ty_generics #where_clause {}
        }
    } else {
        quote! {
            unsafe impl #impl_generics #host::__SharedMemorySafePrivate for #name #ty_generics
            where
                #(#predicates),*
            {}
        }
    };

    Ok(expanded.into())
}

/// Path of the crate that owns the trait, as seen from the expansion site.
fn host_crate_path() -> proc_macro2::TokenStream {
    match crate_name("baton") {
        Ok(FoundCrate::Itself) => quote!(::baton),
        Ok(FoundCrate::Name(name)) => {
            let ident = syn::Ident::new(&name, proc_macro2::Span::call_site());
            quote!(::#ident)
        }
        Err(_) => quote!(::baton),
    }
}

/// Reprs with a layout the compiler may not rearrange.
const STABLE_REPRS: &[&str] = &[
    "C", "transparent", "u8", "u16", "u32", "u64", "u128", "usize", "i8", "i16", "i32", "i64",
    "i128", "isize",
];

fn is_stable_repr(attr: &Attribute) -> syn::Result<bool> {
    if !attr.path().is_ident("repr") {
        return Ok(false);
    }
    let mut stable = false;
    attr.parse_nested_meta(|meta| {
        if let Some(ident) = meta.path.get_ident()
            && STABLE_REPRS.iter().any(|&repr| ident == repr)
        {
            stable = true;
        }
        Ok(())
    })?;
    Ok(stable)
}

fn require_stable_repr(input: &DeriveInput) -> syn::Result<()> {
    for attr in &input.attrs {
        if is_stable_repr(attr)? {
            return Ok(());
        }
    }
    let help = if matches!(input.data, Data::Enum(_)) {
        "SharedMemorySafe needs a stable layout: #[repr(C)] or an integer repr like #[repr(u8)]\n\
         help: add #[repr(u8)] above this enum"
    } else {
        "SharedMemorySafe needs a stable layout: #[repr(C)] or #[repr(transparent)]\n\
         help: add #[repr(C)] above this item"
    };
    Err(Error::new(input.span(), help))
}

fn field_types(data: &Data) -> syn::Result<Vec<Type>> {
    fn of_fields(fields: &Fields) -> Vec<Type> {
        match fields {
            Fields::Named(fields) => fields.named.iter().map(|f| f.ty.clone()).collect(),
            Fields::Unnamed(fields) => fields.unnamed.iter().map(|f| f.ty.clone()).collect(),
            Fields::Unit => Vec::new(),
        }
    }

    match data {
        Data::Struct(s) => Ok(of_fields(&s.fields)),
        Data::Enum(e) => Ok(e.variants.iter().flat_map(|v| of_fields(&v.fields)).collect()),
        Data::Union(u) => Err(Error::new(
            u.union_token.span,
            "SharedMemorySafe cannot be derived for unions",
        )),
    }
}

/// Walks a field type and rejects anything that stores a process-specific
/// address, however deeply nested.
fn reject_address_carriers(field_ty: &Type) -> syn::Result<()> {
    fn walk(ty: &Type, field_ty: &Type) -> syn::Result<()> {
        match ty {
            Type::Path(TypePath { path, .. }) => {
                for segment in &path.segments {
                    if let Some(msg) = forbidden_ident_help(&segment.ident, field_ty) {
                        return Err(Error::new(segment.ident.span(), msg));
                    }
                    match &segment.arguments {
                        PathArguments::AngleBracketed(args) => {
                            for arg in &args.args {
                                if let GenericArgument::Type(inner) = arg {
                                    walk(inner, field_ty)?;
                                }
                            }
                        }
                        PathArguments::Parenthesized(args) => {
                            for input in &args.inputs {
                                walk(input, field_ty)?;
                            }
                            if let ReturnType::Type(_, ret) = &args.output {
                                walk(ret, field_ty)?;
                            }
                        }
                        PathArguments::None => {}
                    }
                }
                Ok(())
            }
            Type::Reference(r) => Err(Error::new(
                r.span(),
                format!(
                    "Field type `{}` contains a reference.\n\
                     A mapped address is only meaningful inside the process that mapped it.\n\
                     help: store the data inline instead",
                    quote!(#field_ty),
                ),
            )),
            Type::Ptr(p) => Err(Error::new(
                p.span(),
                format!(
                    "Field type `{}` contains a raw pointer.\n\
                     A mapped address is only meaningful inside the process that mapped it.\n\
                     help: store the data inline instead",
                    quote!(#field_ty),
                ),
            )),
            Type::Tuple(t) => t.elems.iter().try_for_each(|elem| walk(elem, field_ty)),
            Type::Array(a) => walk(&a.elem, field_ty),
            Type::Slice(s) => walk(&s.elem, field_ty),
            Type::Group(g) => walk(&g.elem, field_ty),
            Type::Paren(p) => walk(&p.elem, field_ty),
            // Remaining variants cannot appear as concrete field types or
            // carry no nested types worth checking.
            _ => Ok(()),
        }
    }

    walk(field_ty, field_ty)
}

const HEAP_OWNERS: &[&str] = &["Vec", "Box", "String", "PathBuf", "OsString", "CString"];
const REF_COUNTED: &[&str] = &["Rc", "Arc"];
const PROCESS_LOCAL: &[&str] = &["Mutex", "RwLock", "Condvar", "Barrier", "Once", "OnceLock"];

fn forbidden_ident_help(ident: &Ident, field_ty: &Type) -> Option<String> {
    if HEAP_OWNERS.iter().any(|&name| ident == name) {
        Some(format!(
            "Field type `{}` contains `{ident}`, which owns a heap allocation.\n\
             Shared memory cannot hold pointer types.\n\
             help: store the data inline, e.g. `[T; N]` instead of `Vec<T>`",
            quote!(#field_ty),
        ))
    } else if REF_COUNTED.iter().any(|&name| ident == name) {
        Some(format!(
            "Field type `{}` contains `{ident}`, which is a reference-counted pointer.\n\
             Shared memory cannot hold pointer types.\n\
             help: store the data inline or behind an atomic",
            quote!(#field_ty),
        ))
    } else if PROCESS_LOCAL.iter().any(|&name| ident == name) {
        Some(format!(
            "Field type `{}` contains `{ident}`, which only synchronizes within one process.\n\
             help: use atomics, or the process-shared ShmMutex/ShmCondvar/ShmSemaphore",
            quote!(#field_ty),
        ))
    } else {
        None
    }
}
