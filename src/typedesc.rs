//! The closed registry of slot value types.
//!
//! Every value flowing between nodes carries a [TypeTag]; slot descriptors,
//! connection rules and resource payloads all check against it. Template-style
//! compile-time typing from other engines becomes tag comparison at connection
//! time plus a typed-accessor trait ([TypedValue]) for the node-facing API.

use crate::handle::{
    BufferHandle, DescriptorSetHandle, FenceHandle, ImageHandle, ImageViewHandle, PipelineHandle,
    SamplerHandle, SemaphoreHandle,
};

/// Base value type, without container shape.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum BaseType {
    Image,
    Buffer,
    ImageView,
    Sampler,
    Pipeline,
    DescriptorSet,
    Semaphore,
    Fence,
    UInt,
    Int,
    Float,
    Bool,
    Camera,
    StructSpread,
    /// Bounded discriminated union used at descriptor-gather boundaries.
    DescriptorVariant,
}

/// Container shape of a slot type.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ContainerKind {
    None,
    /// Fixed-length, length checked at connection time.
    Array,
    /// Growable ordered sequence, filled at compile time.
    Vector,
    /// The payload is itself a discriminated union.
    Variant,
}

/// Full slot value type: a base type plus its container shape.
///
/// A container of `T` is registered iff `T` itself is.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct TypeTag {
    pub base: BaseType,
    pub container: ContainerKind,
}

impl TypeTag {
    pub const fn scalar(base: BaseType) -> TypeTag {
        TypeTag {
            base,
            container: ContainerKind::None,
        }
    }

    pub const fn sequence(base: BaseType) -> TypeTag {
        TypeTag {
            base,
            container: ContainerKind::Vector,
        }
    }

    pub const fn array(base: BaseType) -> TypeTag {
        TypeTag {
            base,
            container: ContainerKind::Array,
        }
    }

    /// True if this tag is a member of the registry.
    ///
    /// The registry is closed: all base types are known, `Variant` is only
    /// valid for [BaseType::DescriptorVariant], and fences never travel in
    /// containers (they are per-frame sync objects, not gatherable data).
    pub fn is_registered(self) -> bool {
        match self.container {
            ContainerKind::None => true,
            ContainerKind::Variant => self.base == BaseType::DescriptorVariant,
            ContainerKind::Array | ContainerKind::Vector => {
                !matches!(self.base, BaseType::Fence | BaseType::Semaphore)
            }
        }
    }

    pub fn is_container(self) -> ContainerKind {
        self.container
    }

    /// Tag of a single element of this container type.
    pub fn element(self) -> TypeTag {
        TypeTag::scalar(self.base)
    }
}

//--------------------------------------------------------------------------------------------------

/// Small POD camera payload passed between culling/render nodes.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct CameraData {
    pub view: [[f32; 4]; 4],
    pub proj: [[f32; 4]; 4],
    pub position: [f32; 3],
    pub near: f32,
    pub far: f32,
}

impl Default for CameraData {
    fn default() -> CameraData {
        let ident = [
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ];
        CameraData {
            view: ident,
            proj: ident,
            position: [0.0; 3],
            near: 0.1,
            far: 1000.0,
        }
    }
}

/// Bounded inline byte payload for struct-spreader nodes. Values larger than
/// `StructSpread::CAPACITY` must travel as buffers instead.
#[derive(Copy, Clone)]
pub struct StructSpread {
    bytes: [u8; StructSpread::CAPACITY],
    len: u8,
}

impl StructSpread {
    pub const CAPACITY: usize = 64;

    pub fn new(data: &[u8]) -> Option<StructSpread> {
        if data.len() > StructSpread::CAPACITY {
            return None;
        }
        let mut bytes = [0u8; StructSpread::CAPACITY];
        bytes[..data.len()].copy_from_slice(data);
        Some(StructSpread {
            bytes,
            len: data.len() as u8,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl PartialEq for StructSpread {
    fn eq(&self, other: &StructSpread) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl ::std::fmt::Debug for StructSpread {
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
        write!(f, "StructSpread({} bytes)", self.len)
    }
}

/// A reference to one GPU binding, as gathered across node boundaries.
///
/// Mirrors the descriptor types a pipeline can consume; the variant in a
/// sequence slot is what descriptor-gather nodes accumulate.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum DescriptorHandleVariant {
    SampledImage {
        view: ImageViewHandle,
        sampler: SamplerHandle,
    },
    StorageImage {
        view: ImageViewHandle,
    },
    UniformBuffer {
        buffer: BufferHandle,
        offset: u64,
        size: u64,
    },
    StorageBuffer {
        buffer: BufferHandle,
        offset: u64,
        size: u64,
    },
    InputAttachment {
        view: ImageViewHandle,
    },
}

//--------------------------------------------------------------------------------------------------

/// Ordered sequence payload. Element tag is stored next to the items so
/// accumulation can type-check each append.
#[derive(Clone, Debug, PartialEq)]
pub struct SequenceValue {
    elem: BaseType,
    items: Vec<SlotValue>,
}

impl SequenceValue {
    pub fn with_capacity(elem: BaseType, capacity: usize) -> SequenceValue {
        SequenceValue {
            elem,
            items: Vec::with_capacity(capacity),
        }
    }

    pub fn element_type(&self) -> BaseType {
        self.elem
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[SlotValue] {
        &self.items
    }

    /// Appends one element; the element's tag must match.
    pub fn push(&mut self, value: SlotValue) -> bool {
        if value.tag().base != self.elem || value.tag().container != ContainerKind::None {
            return false;
        }
        self.items.push(value);
        true
    }
}

/// Type-erased slot payload: a discriminated union whose variants match the
/// registry, tag bits stored next to the payload.
#[derive(Clone, Debug, PartialEq)]
pub enum SlotValue {
    Image(ImageHandle),
    Buffer(BufferHandle),
    ImageView(ImageViewHandle),
    Sampler(SamplerHandle),
    Pipeline(PipelineHandle),
    DescriptorSet(DescriptorSetHandle),
    Semaphore(SemaphoreHandle),
    Fence(FenceHandle),
    UInt(u64),
    Int(i64),
    Float(f64),
    Bool(bool),
    Camera(CameraData),
    StructSpread(StructSpread),
    DescriptorVariant(DescriptorHandleVariant),
    Sequence(SequenceValue),
}

impl SlotValue {
    pub fn tag(&self) -> TypeTag {
        match self {
            SlotValue::Image(_) => TypeTag::scalar(BaseType::Image),
            SlotValue::Buffer(_) => TypeTag::scalar(BaseType::Buffer),
            SlotValue::ImageView(_) => TypeTag::scalar(BaseType::ImageView),
            SlotValue::Sampler(_) => TypeTag::scalar(BaseType::Sampler),
            SlotValue::Pipeline(_) => TypeTag::scalar(BaseType::Pipeline),
            SlotValue::DescriptorSet(_) => TypeTag::scalar(BaseType::DescriptorSet),
            SlotValue::Semaphore(_) => TypeTag::scalar(BaseType::Semaphore),
            SlotValue::Fence(_) => TypeTag::scalar(BaseType::Fence),
            SlotValue::UInt(_) => TypeTag::scalar(BaseType::UInt),
            SlotValue::Int(_) => TypeTag::scalar(BaseType::Int),
            SlotValue::Float(_) => TypeTag::scalar(BaseType::Float),
            SlotValue::Bool(_) => TypeTag::scalar(BaseType::Bool),
            SlotValue::Camera(_) => TypeTag::scalar(BaseType::Camera),
            SlotValue::StructSpread(_) => TypeTag::scalar(BaseType::StructSpread),
            SlotValue::DescriptorVariant(_) => TypeTag {
                base: BaseType::DescriptorVariant,
                container: ContainerKind::Variant,
            },
            SlotValue::Sequence(seq) => TypeTag::sequence(seq.element_type()),
        }
    }
}

/// Typed access into [SlotValue]. Implemented for every registered scalar
/// type; sequences are read through [SlotValue::Sequence] directly.
pub trait TypedValue: Sized {
    const TAG: TypeTag;

    fn into_value(self) -> SlotValue;
    fn from_value(value: &SlotValue) -> Option<Self>;
}

macro_rules! typed_value {
    ($ty:ty, $base:ident, $variant:ident) => {
        impl TypedValue for $ty {
            const TAG: TypeTag = TypeTag::scalar(BaseType::$base);

            fn into_value(self) -> SlotValue {
                SlotValue::$variant(self)
            }

            fn from_value(value: &SlotValue) -> Option<$ty> {
                match value {
                    SlotValue::$variant(v) => Some(*v),
                    _ => None,
                }
            }
        }
    };
}

typed_value!(ImageHandle, Image, Image);
typed_value!(BufferHandle, Buffer, Buffer);
typed_value!(ImageViewHandle, ImageView, ImageView);
typed_value!(SamplerHandle, Sampler, Sampler);
typed_value!(PipelineHandle, Pipeline, Pipeline);
typed_value!(DescriptorSetHandle, DescriptorSet, DescriptorSet);
typed_value!(SemaphoreHandle, Semaphore, Semaphore);
typed_value!(FenceHandle, Fence, Fence);
typed_value!(u64, UInt, UInt);
typed_value!(i64, Int, Int);
typed_value!(f64, Float, Float);
typed_value!(bool, Bool, Bool);
typed_value!(CameraData, Camera, Camera);
typed_value!(StructSpread, StructSpread, StructSpread);

impl TypedValue for DescriptorHandleVariant {
    const TAG: TypeTag = TypeTag {
        base: BaseType::DescriptorVariant,
        container: ContainerKind::Variant,
    };

    fn into_value(self) -> SlotValue {
        SlotValue::DescriptorVariant(self)
    }

    fn from_value(value: &SlotValue) -> Option<DescriptorHandleVariant> {
        match value {
            SlotValue::DescriptorVariant(v) => Some(*v),
            _ => None,
        }
    }
}
