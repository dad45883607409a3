//! Type-erased allocation header.
//!
//! Grounded on `ce2103::mm::allocation` (`include/ce2103/mm/gc.hpp`) and
//! its out-of-line members in `src/gc.cpp`. The C++ version hides a
//! compile-time-constructed `type` descriptor behind a reference; this
//! port replaces that trick with one `TypeDescriptor` per concrete
//! element type, built once via a monomorphized `OnceLock`, per
//! SPEC_FULL.md's note on type-erased payload metadata.

use std::any::{Any, TypeId};
use std::fmt::Write as _;
use std::mem;
use std::sync::OnceLock;

/// Static, per-concrete-type metadata needed to destroy and render a
/// payload without knowing its type at the call site.
pub struct TypeDescriptor {
    type_id: TypeId,
    type_name: &'static str,
    element_size: usize,
    header_padding: usize,
    destructor: Option<unsafe fn(*mut u8)>,
    represent: unsafe fn(*const u8, usize, &mut String),
}

impl TypeDescriptor {
    /// Padding bytes between the header and the payload so the payload
    /// lands aligned to `align_of::<T>()`.
    ///
    /// Deliberate divergence from the original (`gc.hpp`'s
    /// `header_padding_of`, which pads from `alignof(allocation)`
    /// instead of `sizeof(allocation)` and so under-pads whenever a
    /// payload's alignment exceeds the header's own 8-byte alignment);
    /// padding needs to account for how far the payload actually sits
    /// past the header, i.e. `size_of::<Allocation>()`, not the
    /// header's own alignment. See DESIGN.md.
    fn header_padding_of<T>() -> usize {
        let align_t = mem::align_of::<T>();
        let header_size = mem::size_of::<Allocation>();
        (align_t - header_size % align_t) % align_t
    }

    pub(crate) fn header_padding(&self) -> usize {
        self.header_padding
    }

    pub(crate) fn element_size(&self) -> usize {
        self.element_size
    }
}

unsafe fn destroy_one<T>(object: *mut u8) {
    std::ptr::drop_in_place(object as *mut T);
}

/// Renders a single value of statically-known type `T`, falling back to
/// an opaque `{...}` for anything that is not a recognized primitive or
/// string type — the same three-way split
/// (`is_fundamental`/`is_same<string>`/else) as the original.
fn render_one<T: 'static>(value: &T, out: &mut String) {
    let any = value as &dyn Any;

    macro_rules! try_numeric {
        ($($ty:ty),+) => {
            $(
                if let Some(v) = any.downcast_ref::<$ty>() {
                    let _ = write!(out, "{v}");
                    return;
                }
            )+
        };
    }

    try_numeric!(i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32, f64, bool, char);

    if let Some(v) = any.downcast_ref::<String>() {
        out.push('"');
        out.push_str(v);
        out.push('"');
        return;
    }

    if let Some(v) = any.downcast_ref::<&str>() {
        out.push('"');
        out.push_str(v);
        out.push('"');
        return;
    }

    out.push_str("{...}");
}

unsafe fn represent_single<T: 'static>(base: *const u8, _count: usize, out: &mut String) {
    let value = &*(base as *const T);
    render_one(value, out);
}

unsafe fn represent_array<T: 'static>(base: *const u8, count: usize, out: &mut String) {
    out.push('[');
    for i in 0..count {
        if i > 0 {
            out.push(',');
        }

        let element = base.add(i * mem::size_of::<T>());
        represent_single::<T>(element, 1, out);
    }
    out.push(']');
}

/// Returns the descriptor used for a single (count == 1, non-forced-array)
/// allocation of `T`.
pub fn single_descriptor<T: 'static>() -> &'static TypeDescriptor {
    static CACHE: OnceLock<TypeDescriptor> = OnceLock::new();
    CACHE.get_or_init(|| TypeDescriptor {
        type_id: TypeId::of::<T>(),
        type_name: std::any::type_name::<T>(),
        element_size: mem::size_of::<T>(),
        header_padding: TypeDescriptor::header_padding_of::<T>(),
        destructor: mem::needs_drop::<T>().then_some(destroy_one::<T> as unsafe fn(*mut u8)),
        represent: represent_single::<T>,
    })
}

/// Returns the descriptor used for an array allocation of `T` (count > 1,
/// or a forced single-element array).
pub fn array_descriptor<T: 'static>() -> &'static TypeDescriptor {
    static CACHE: OnceLock<TypeDescriptor> = OnceLock::new();
    CACHE.get_or_init(|| TypeDescriptor {
        type_id: TypeId::of::<T>(),
        type_name: std::any::type_name::<T>(),
        element_size: mem::size_of::<T>(),
        header_padding: TypeDescriptor::header_padding_of::<T>(),
        destructor: mem::needs_drop::<T>().then_some(destroy_one::<T> as unsafe fn(*mut u8)),
        represent: represent_array::<T>,
    })
}

/// The header placed at the start of every managed block.
///
/// Byte layout: `[Allocation][padding][payload[0..count]]`, where
/// `padding` brings the payload up to `align_of::<T>()`.
#[repr(C)]
pub struct Allocation {
    descriptor: &'static TypeDescriptor,
    count: usize,
}

impl Allocation {
    /// Placement-constructs an `Allocation` at `ptr`, with zero
    /// initialized elements. Callers must construct the payload and call
    /// [`set_initialized`](Allocation::set_initialized) afterwards.
    ///
    /// # Safety
    /// `ptr` must be valid for writes of `size_of::<Allocation>()` bytes
    /// and suitably aligned.
    pub unsafe fn init_at(ptr: *mut Allocation, descriptor: &'static TypeDescriptor) {
        ptr.write(Allocation {
            descriptor,
            count: 0,
        });
    }

    /// Finalizes the number of constructed payload elements. Called
    /// exactly once, after all element constructors have succeeded.
    pub fn set_initialized(&mut self, count: usize) {
        self.count = count;
    }

    /// Number of constructed payload elements (0 until `set_initialized`
    /// runs).
    pub fn count(&self) -> usize {
        self.count
    }

    /// The type-identity token of the concrete payload type.
    pub fn type_id(&self) -> TypeId {
        self.descriptor.type_id
    }

    /// A human-readable name of the concrete payload type, the port's
    /// substitute for demangled RTTI.
    pub fn type_name(&self) -> &'static str {
        self.descriptor.type_name
    }

    /// `header_size + padding + elem_size * count`.
    pub fn total_size(&self) -> usize {
        mem::size_of::<Allocation>() + self.descriptor.header_padding + self.descriptor.element_size * self.count
    }

    /// Address of the first payload element.
    pub fn payload_base(&self) -> *mut u8 {
        unsafe {
            (self as *const Allocation as *mut u8)
                .add(mem::size_of::<Allocation>() + self.descriptor.header_padding)
        }
    }

    /// Runs the descriptor's destructor over every initialized element.
    /// A no-op if the descriptor's destructor is `None` (trivially
    /// destructible payload).
    ///
    /// # Safety
    /// Must be called at most once per allocation, after
    /// `set_initialized`, and before the backing memory is released.
    pub unsafe fn destroy_all(&mut self) {
        if let Some(destructor) = self.descriptor.destructor {
            let mut element = self.payload_base();
            for _ in 0..self.count {
                destructor(element);
                element = element.add(self.descriptor.element_size);
            }
        }
    }

    /// Produces a human-readable debug snapshot of the payload.
    pub fn represent(&self) -> String {
        let mut output = String::new();
        unsafe {
            (self.descriptor.represent)(self.payload_base(), self.count, &mut output);
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn represents_primitives_and_strings() {
        let value = 42i32;
        let mut out = String::new();
        render_one(&value, &mut out);
        assert_eq!(out, "42");

        let value = String::from("hi");
        let mut out = String::new();
        render_one(&value, &mut out);
        assert_eq!(out, "\"hi\"");
    }

    #[test]
    fn represents_opaque_types_as_placeholder() {
        struct Opaque {
            _field: u8,
        }

        let value = Opaque { _field: 1 };
        let mut out = String::new();
        render_one(&value, &mut out);
        assert_eq!(out, "{...}");
    }

    #[test]
    fn header_padding_respects_alignment() {
        #[repr(align(16))]
        struct Aligned(u8);

        let padding = TypeDescriptor::header_padding_of::<Aligned>();
        let header_size = mem::size_of::<Allocation>() + padding;
        assert_eq!(header_size % mem::align_of::<Aligned>(), 0);
    }
}
