use super::*;
use crate::jvm::class_file::{ClassConstantIndex, Constant, ConstantsPool, StackMapFrame};
use crate::jvm::code::{BranchInstruction, Instruction, InvokeType};
use crate::jvm::{
    ArrayType, BaseType, BinaryName, Error, FieldType, RefType, UnqualifiedName, VerifierErrorKind,
};
use crate::util::{OffsetVec, Width};

/// Stack map frame in the compact form stored in the class file
///
/// Category-2 values occupy one entry (but two offsets).
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct Frame<Cls, U> {
    /// Local variables in scope
    pub locals: OffsetVec<VerificationType<Cls, U>>,

    /// Types of values on the stack
    pub stack: OffsetVec<VerificationType<Cls, U>>,
}

/// Value on the operand stack during analysis
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct StackValue {
    pub vtype: VType,

    /// Index of the node which pushed this value (`None` when control flow merges values
    /// pushed by different nodes)
    pub origin: Option<usize>,
}

impl Width for StackValue {
    fn width(&self) -> usize {
        self.vtype.width()
    }
}

/// Snapshot of the stack and local variables at a point in a method body
///
/// Unlike [`Frame`], locals are stored one entry per slot: a `long` or `double` local is followed
/// by a `Top` entry for its upper half. That makes stores to arbitrary slots simple.
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct VerifierFrame {
    pub locals: Vec<VType>,
    pub stack: Vec<StackValue>,
}

impl VerifierFrame {
    /// Frame on entry to a method
    pub fn method_entry(context: &MethodContext) -> VerifierFrame {
        let mut frame = VerifierFrame::default();
        if !context.is_static {
            let this_type = if context.is_constructor && context.this_class != BinaryName::OBJECT {
                VType::UninitializedThis
            } else {
                VType::object(context.this_class.clone())
            };
            frame.locals.push(this_type);
        }
        for parameter in &context.descriptor.parameters {
            let vtype = VType::from(parameter.clone());
            let width = vtype.width();
            frame.locals.push(vtype);
            if width == 2 {
                frame.locals.push(VType::Top);
            }
        }
        frame
    }

    /// Height of the operand stack (in slots)
    pub fn stack_height(&self) -> usize {
        self.stack.iter().map(|value| value.width()).sum()
    }

    /// Type of the local variable starting at a slot, if the slot holds something usable
    pub fn local(&self, index: u16) -> Option<&VType> {
        match self.locals.get(index as usize) {
            Some(VType::Top) | None => None,
            Some(vtype) => Some(vtype),
        }
    }

    /// Push a value pushed by the given node
    pub fn push(&mut self, vtype: VType, origin: usize) {
        self.stack.push(StackValue {
            vtype,
            origin: Some(origin),
        });
    }

    fn pop(&mut self) -> Result<StackValue, VerifierErrorKind> {
        self.stack.pop().ok_or(VerifierErrorKind::EmptyStack)
    }

    fn pop_expecting_width(&mut self, expected_width: usize) -> Result<StackValue, VerifierErrorKind> {
        let value = self.pop()?;
        let found_width = value.width();
        if found_width == expected_width {
            Ok(value)
        } else {
            Err(VerifierErrorKind::InvalidWidth(found_width))
        }
    }

    fn pop_expecting_type(
        &mut self,
        expected_type: &VType,
        context: &MethodContext,
    ) -> Result<StackValue, VerifierErrorKind> {
        let value = self.pop()?;
        if VType::is_assignable(&value.vtype, expected_type, context.hierarchy) {
            Ok(value)
        } else {
            Err(incompatible(&value.vtype, expected_type))
        }
    }

    fn pop_reference(&mut self) -> Result<StackValue, VerifierErrorKind> {
        let value = self.pop()?;
        if value.vtype.is_reference() {
            Ok(value)
        } else {
            Err(VerifierErrorKind::InvalidType)
        }
    }

    /// Pop an array reference, checking that it is one of the given element types
    fn pop_array(&mut self, element_types: &[BaseType]) -> Result<(), VerifierErrorKind> {
        match self.pop()?.vtype {
            VType::Null => Ok(()),
            VType::Object(RefType::PrimitiveArray(ArrayType {
                additional_dimensions: 0,
                element_type,
            })) if element_types.contains(&element_type) => Ok(()),
            _ => Err(VerifierErrorKind::NotArrayType),
        }
    }

    fn load(&self, index: u16, expected_type: &VType) -> Result<(), VerifierErrorKind> {
        match self.locals.get(index as usize) {
            Some(found) if found == expected_type => {
                if expected_type.width() == 2 && self.locals.len() <= index as usize + 1 {
                    Err(VerifierErrorKind::InvalidIndex)
                } else {
                    Ok(())
                }
            }
            Some(found) => Err(incompatible(found, expected_type)),
            None => Err(VerifierErrorKind::InvalidIndex),
        }
    }

    fn load_reference(&self, index: u16) -> Result<VType, VerifierErrorKind> {
        match self.locals.get(index as usize) {
            Some(found) if found.is_reference() => Ok(found.clone()),
            Some(_) => Err(VerifierErrorKind::InvalidType),
            None => Err(VerifierErrorKind::InvalidIndex),
        }
    }

    /// Overwrite a local, invalidating any category-2 value it clobbers
    pub fn store(&mut self, index: u16, vtype: VType) {
        let index = index as usize;
        let width = vtype.width();
        if self.locals.len() < index + width {
            self.locals.resize(index + width, VType::Top);
        }
        if index > 0 && self.locals[index - 1].width() == 2 {
            self.locals[index - 1] = VType::Top;
        }
        if self.locals[index].width() == 2 && width == 1 {
            if let Some(upper) = self.locals.get_mut(index + 1) {
                *upper = VType::Top;
            }
        }
        self.locals[index] = vtype;
        if width == 2 {
            self.locals[index + 1] = VType::Top;
        }
    }

    fn replace_all(&mut self, original: &VType, updated: &VType) {
        for local in self.locals.iter_mut() {
            if local == original {
                *local = updated.clone();
            }
        }
        for value in self.stack.iter_mut() {
            if &value.vtype == original {
                value.vtype = updated.clone();
            }
        }
    }

    /// Merge another frame reaching the same point into this one
    ///
    /// Returns whether this frame changed.
    pub fn merge(
        &mut self,
        other: &VerifierFrame,
        context: &MethodContext,
    ) -> Result<bool, VerifierErrorKind> {
        if self.stack.len() != other.stack.len() {
            return Err(VerifierErrorKind::StackHeightMismatch(
                self.stack_height(),
                other.stack_height(),
            ));
        }

        let mut changed = false;
        for (value, other_value) in self.stack.iter_mut().zip(&other.stack) {
            let merged = VType::merge(&value.vtype, &other_value.vtype, context.hierarchy);
            if merged == VType::Top || merged.width() != value.width() {
                return Err(incompatible(&value.vtype, &other_value.vtype));
            }
            if merged != value.vtype {
                value.vtype = merged;
                changed = true;
            }
            if value.origin.is_some() && value.origin != other_value.origin {
                value.origin = None;
                changed = true;
            }
        }

        // Locals missing on one side are unusable after the merge
        if other.locals.len() < self.locals.len() {
            self.locals.truncate(other.locals.len());
            changed = true;
        }
        for (local, other_local) in self.locals.iter_mut().zip(&other.locals) {
            let merged = VType::merge(local, other_local, context.hierarchy);
            if &merged != local {
                *local = merged;
                changed = true;
            }
        }

        // A category-2 local whose upper half was lost is no longer usable
        for slot in 0..self.locals.len() {
            if self.locals[slot].width() == 2 && self.locals.get(slot + 1) != Some(&VType::Top) {
                self.locals[slot] = VType::Top;
                changed = true;
            }
        }

        Ok(changed)
    }

    /// Resolve the frame into its serializable form
    ///
    /// Trailing unusable locals are dropped, and uninitialized types are turned into the offset
    /// of the `new` instruction (using `node_offset`).
    pub fn into_serializable(
        &self,
        constants: &mut ConstantsPool,
        node_offset: impl Fn(usize) -> Option<u16>,
    ) -> Result<Frame<ClassConstantIndex, u16>, Error> {
        let mut resolve = |vtype: &VType| -> Result<VerificationType<ClassConstantIndex, u16>, Error> {
            Ok(match vtype {
                VerificationType::Object(ref_type) => {
                    VerificationType::Object(constants.get_class(ref_type)?)
                }
                VerificationType::Uninitialized(node) => VerificationType::Uninitialized(
                    node_offset(*node).ok_or(Error::InvalidCodeOffset(*node))?,
                ),
                VerificationType::Top => VerificationType::Top,
                VerificationType::Integer => VerificationType::Integer,
                VerificationType::Float => VerificationType::Float,
                VerificationType::Long => VerificationType::Long,
                VerificationType::Double => VerificationType::Double,
                VerificationType::Null => VerificationType::Null,
                VerificationType::UninitializedThis => VerificationType::UninitializedThis,
            })
        };

        let mut locals = OffsetVec::new();
        let used_locals = self
            .locals
            .iter()
            .rposition(|local| local != &VType::Top)
            .map_or(0, |last| last + 1);
        let mut slot = 0;
        while slot < used_locals {
            let local = &self.locals[slot];
            locals.push(resolve(local)?);
            slot += local.width();
        }

        let mut stack = OffsetVec::new();
        for value in &self.stack {
            stack.push(resolve(&value.vtype)?);
        }

        Ok(Frame { locals, stack })
    }

    /// Update the frame to reflect the effects of the given (non-branching) instruction
    ///
    /// `node` is the index of the instruction, which is recorded as the origin of anything it
    /// pushes.
    pub fn verify_instruction(
        &mut self,
        insn: &Instruction,
        node: usize,
        constants: &ConstantsPool,
        context: &MethodContext,
    ) -> Result<(), VerifierErrorKind> {
        verify_instruction(self, insn, node, constants, context)
    }

    /// Update the frame to reflect the effects of the given branching instruction
    pub fn verify_branch_instruction<Lbl, LblWide>(
        &mut self,
        insn: &BranchInstruction<Lbl, LblWide>,
        context: &MethodContext,
    ) -> Result<(), VerifierErrorKind> {
        verify_branch_instruction(self, insn, context)
    }
}

impl Frame<ClassConstantIndex, u16> {
    /// Compute a stack map frame for this frame, given the previous frame
    ///
    /// This will fall back to the `Full` option using [`Self::full_stack_map_frame`] only if none of the
    /// other stack map frame variants are enough to encode the transition.
    pub fn stack_map_frame(&self, offset_delta: u16, previous_frame: &Self) -> StackMapFrame {
        match self.stack.len() {
            0 => {
                let this_locals_len = self.locals.len();
                let prev_locals_len = previous_frame.locals.len();

                if this_locals_len <= prev_locals_len {
                    let len_difference = prev_locals_len - this_locals_len;
                    if len_difference < 4 {
                        let this_is_prefix_of_pref = self
                            .locals
                            .iter()
                            .zip(previous_frame.locals.iter())
                            .all(|((_, _, t1), (_, _, t2))| t1 == t2);

                        if this_is_prefix_of_pref {
                            if len_difference == 0 {
                                return StackMapFrame::SameLocalsNoStack { offset_delta };
                            } else {
                                return StackMapFrame::ChopLocalsNoStack {
                                    offset_delta,
                                    chopped_k: len_difference as u8,
                                };
                            }
                        }
                    }
                } else if this_locals_len - prev_locals_len < 4 {
                    let prev_is_prefix_of_this = self
                        .locals
                        .iter()
                        .zip(previous_frame.locals.iter())
                        .all(|((_, _, t1), (_, _, t2))| t1 == t2);

                    if prev_is_prefix_of_this {
                        return StackMapFrame::AppendLocalsNoStack {
                            offset_delta,
                            locals: self
                                .locals
                                .iter()
                                .skip(prev_locals_len)
                                .map(|(_, _, t)| *t)
                                .collect(),
                        };
                    }
                }
            }
            1 if self.locals == previous_frame.locals => {
                if let Some((_, _, stack)) = self.stack.iter().next() {
                    return StackMapFrame::SameLocalsOneStack {
                        offset_delta,
                        stack: *stack,
                    };
                }
            }
            _ => (),
        }

        self.full_stack_map_frame(offset_delta)
    }

    /// Compute a `Full` stack map frame
    pub fn full_stack_map_frame(&self, offset_delta: u16) -> StackMapFrame {
        StackMapFrame::Full {
            offset_delta,
            stack: self.stack.iter().map(|(_, _, t)| *t).collect(),
            locals: self.locals.iter().map(|(_, _, t)| *t).collect(),
        }
    }
}

fn incompatible(found: &VType, expected: &VType) -> VerifierErrorKind {
    VerifierErrorKind::IncompatibleTypes(format!("{:?}", found), format!("{:?}", expected))
}

fn constant_error(error: Error) -> VerifierErrorKind {
    match error {
        Error::MissingConstant(index) => VerifierErrorKind::MissingConstant(index),
        other => VerifierErrorKind::BadConstant(format!("{:?}", other)),
    }
}

/// Type of the element loaded out of an array of references
fn array_element_type(array_type: &RefType<BinaryName>) -> Option<VType> {
    match array_type {
        RefType::ObjectArray(arr) => Some(match arr.additional_dimensions {
            0 => VType::object(arr.element_type.clone()),
            n => VType::Object(RefType::ObjectArray(ArrayType {
                additional_dimensions: n - 1,
                element_type: arr.element_type.clone(),
            })),
        }),
        RefType::PrimitiveArray(arr) if arr.additional_dimensions > 0 => {
            Some(VType::Object(RefType::PrimitiveArray(ArrayType {
                additional_dimensions: arr.additional_dimensions - 1,
                element_type: arr.element_type,
            })))
        }
        _ => None,
    }
}

fn loadable_constant_type(
    constant: &Constant,
    constants: &ConstantsPool,
) -> Result<VType, VerifierErrorKind> {
    Ok(match constant {
        Constant::Integer(_) => VType::Integer,
        Constant::Float(_) => VType::Float,
        Constant::Long(_) => VType::Long,
        Constant::Double(_) => VType::Double,
        Constant::String(_) => VType::object(BinaryName::STRING),
        Constant::Class(_) => VType::object(BinaryName::CLASS),
        Constant::MethodHandle { .. } => VType::object(BinaryName::METHODHANDLE),
        Constant::MethodType { .. } => VType::object(BinaryName::METHODTYPE),
        Constant::Dynamic { name_and_type, .. } => {
            let (_, descriptor) = constants
                .name_and_type(*name_and_type)
                .map_err(constant_error)?;
            let field_type = constants
                .field_descriptor(descriptor)
                .map_err(|err| VerifierErrorKind::BadDescriptor(format!("{:?}", err)))?;
            VType::from(field_type)
        }
        other => return Err(VerifierErrorKind::NotLoadableConstant(other.clone())),
    })
}

fn verify_instruction(
    frame: &mut VerifierFrame,
    insn: &Instruction,
    node: usize,
    constants: &ConstantsPool,
    context: &MethodContext,
) -> Result<(), VerifierErrorKind> {
    use Instruction::*;

    let primitive_array =
        |base_type: BaseType| VType::Object(RefType::array(FieldType::Base(base_type)));

    match insn {
        Nop => (),
        AConstNull => frame.push(VType::Null, node),
        IConstM1 | IConst0 | IConst1 | IConst2 | IConst3 | IConst4 | IConst5 => {
            frame.push(VType::Integer, node);
        }
        LConst0 | LConst1 => frame.push(VType::Long, node),
        FConst0 | FConst1 | FConst2 => frame.push(VType::Float, node),
        DConst0 | DConst1 => frame.push(VType::Double, node),
        BiPush(_) | SiPush(_) => frame.push(VType::Integer, node),
        Ldc(index) => {
            let constant = constants.get(*index).map_err(constant_error)?;
            let vtype = loadable_constant_type(constant, constants)?;
            if vtype.width() != 1 {
                return Err(VerifierErrorKind::InvalidWidth(vtype.width()));
            }
            frame.push(vtype, node);
        }
        Ldc2(index) => {
            let constant = constants.get(*index).map_err(constant_error)?;
            let vtype = loadable_constant_type(constant, constants)?;
            if vtype.width() != 2 {
                return Err(VerifierErrorKind::InvalidWidth(vtype.width()));
            }
            frame.push(vtype, node);
        }

        ILoad(index) => {
            frame.load(*index, &VType::Integer)?;
            frame.push(VType::Integer, node);
        }
        LLoad(index) => {
            frame.load(*index, &VType::Long)?;
            frame.push(VType::Long, node);
        }
        FLoad(index) => {
            frame.load(*index, &VType::Float)?;
            frame.push(VType::Float, node);
        }
        DLoad(index) => {
            frame.load(*index, &VType::Double)?;
            frame.push(VType::Double, node);
        }
        ALoad(index) => {
            let vtype = frame.load_reference(*index)?;
            frame.push(vtype, node);
        }

        IALoad | LALoad | FALoad | DALoad | BALoad | CALoad | SALoad => {
            frame.pop_expecting_type(&VType::Integer, context)?;
            let (element_types, loaded): (&[BaseType], VType) = match insn {
                IALoad => (&[BaseType::Int], VType::Integer),
                LALoad => (&[BaseType::Long], VType::Long),
                FALoad => (&[BaseType::Float], VType::Float),
                DALoad => (&[BaseType::Double], VType::Double),
                BALoad => (&[BaseType::Byte, BaseType::Boolean], VType::Integer),
                CALoad => (&[BaseType::Char], VType::Integer),
                _ => (&[BaseType::Short], VType::Integer),
            };
            frame.pop_array(element_types)?;
            frame.push(loaded, node);
        }
        AALoad => {
            frame.pop_expecting_type(&VType::Integer, context)?;
            let loaded = match frame.pop()?.vtype {
                VType::Null => VType::Null,
                VType::Object(array_type) => {
                    array_element_type(&array_type).ok_or(VerifierErrorKind::NotArrayType)?
                }
                _ => return Err(VerifierErrorKind::NotArrayType),
            };
            frame.push(loaded, node);
        }

        IStore(index) => {
            frame.pop_expecting_type(&VType::Integer, context)?;
            frame.store(*index, VType::Integer);
        }
        FStore(index) => {
            frame.pop_expecting_type(&VType::Float, context)?;
            frame.store(*index, VType::Float);
        }
        LStore(index) => {
            frame.pop_expecting_type(&VType::Long, context)?;
            frame.store(*index, VType::Long);
        }
        DStore(index) => {
            frame.pop_expecting_type(&VType::Double, context)?;
            frame.store(*index, VType::Double);
        }
        AStore(index) => {
            let value = frame.pop_reference()?;
            frame.store(*index, value.vtype);
        }

        IAStore | LAStore | FAStore | DAStore | BAStore | CAStore | SAStore => {
            let (element_types, stored): (&[BaseType], VType) = match insn {
                IAStore => (&[BaseType::Int], VType::Integer),
                LAStore => (&[BaseType::Long], VType::Long),
                FAStore => (&[BaseType::Float], VType::Float),
                DAStore => (&[BaseType::Double], VType::Double),
                BAStore => (&[BaseType::Byte, BaseType::Boolean], VType::Integer),
                CAStore => (&[BaseType::Char], VType::Integer),
                _ => (&[BaseType::Short], VType::Integer),
            };
            frame.pop_expecting_type(&stored, context)?;
            frame.pop_expecting_type(&VType::Integer, context)?;
            frame.pop_array(element_types)?;
        }
        AAStore => {
            frame.pop_reference()?;
            frame.pop_expecting_type(&VType::Integer, context)?;
            match frame.pop()?.vtype {
                VType::Null => (),
                VType::Object(array_type) if array_element_type(&array_type).is_some() => (),
                _ => return Err(VerifierErrorKind::NotArrayType),
            }
        }

        Pop => {
            frame.pop_expecting_width(1)?;
        }

        Pop2 => {
            let arg1 = frame.pop()?;
            match arg1.width() {
                // Form 1
                1 => {
                    frame.pop_expecting_width(1)?;
                }

                // Form 2
                2 => (),

                other => return Err(VerifierErrorKind::InvalidWidth(other)),
            }
        }

        Dup => {
            let arg1 = frame.pop_expecting_width(1)?;
            frame.stack.push(arg1.clone());
            frame.stack.push(arg1);
        }

        DupX1 => {
            let arg1 = frame.pop_expecting_width(1)?;
            let arg2 = frame.pop_expecting_width(1)?;
            frame.stack.extend([arg1.clone(), arg2, arg1]);
        }

        DupX2 => {
            let arg1 = frame.pop_expecting_width(1)?;
            let arg2 = frame.pop()?;
            match arg2.width() {
                // Form 1
                1 => {
                    let arg3 = frame.pop_expecting_width(1)?;
                    frame.stack.extend([arg1.clone(), arg3, arg2, arg1]);
                }

                // Form 2
                2 => frame.stack.extend([arg1.clone(), arg2, arg1]),

                other => return Err(VerifierErrorKind::InvalidWidth(other)),
            }
        }

        Dup2 => {
            let arg1 = frame.pop()?;
            match arg1.width() {
                // Form 1
                1 => {
                    let arg2 = frame.pop_expecting_width(1)?;
                    frame.stack.extend([arg2.clone(), arg1.clone(), arg2, arg1]);
                }

                // Form 2
                2 => frame.stack.extend([arg1.clone(), arg1]),

                other => return Err(VerifierErrorKind::InvalidWidth(other)),
            }
        }

        Dup2X1 => {
            let arg1 = frame.pop()?;
            let arg2 = frame.pop_expecting_width(1)?;
            match arg1.width() {
                // Form 1
                1 => {
                    let arg3 = frame.pop_expecting_width(1)?;
                    frame
                        .stack
                        .extend([arg2.clone(), arg1.clone(), arg3, arg2, arg1]);
                }

                // Form 2
                2 => frame.stack.extend([arg1.clone(), arg2, arg1]),

                other => return Err(VerifierErrorKind::InvalidWidth(other)),
            }
        }

        Dup2X2 => {
            let arg1 = frame.pop()?;
            match arg1.width() {
                1 => {
                    let arg2 = frame.pop_expecting_width(1)?;
                    let arg3 = frame.pop()?;
                    match arg3.width() {
                        // Form 1
                        1 => {
                            let arg4 = frame.pop_expecting_width(1)?;
                            frame
                                .stack
                                .extend([arg2.clone(), arg1.clone(), arg4, arg3, arg2, arg1]);
                        }

                        // Form 3
                        2 => frame
                            .stack
                            .extend([arg2.clone(), arg1.clone(), arg3, arg2, arg1]),

                        other => return Err(VerifierErrorKind::InvalidWidth(other)),
                    }
                }

                2 => {
                    let arg2 = frame.pop()?;
                    match arg2.width() {
                        // Form 2
                        1 => {
                            let arg3 = frame.pop_expecting_width(1)?;
                            frame.stack.extend([arg1.clone(), arg3, arg2, arg1]);
                        }

                        // Form 4
                        2 => frame.stack.extend([arg1.clone(), arg2, arg1]),

                        other => return Err(VerifierErrorKind::InvalidWidth(other)),
                    }
                }

                other => return Err(VerifierErrorKind::InvalidWidth(other)),
            }
        }

        Swap => {
            let arg1 = frame.pop_expecting_width(1)?;
            let arg2 = frame.pop_expecting_width(1)?;
            frame.stack.extend([arg1, arg2]);
        }

        IAdd | ISub | IDiv | IMul | IRem | IAnd | IOr | IXor | ISh(_) => {
            frame.pop_expecting_type(&VType::Integer, context)?;
            frame.pop_expecting_type(&VType::Integer, context)?;
            frame.push(VType::Integer, node);
        }

        LAdd | LSub | LDiv | LMul | LRem | LAnd | LOr | LXor => {
            frame.pop_expecting_type(&VType::Long, context)?;
            frame.pop_expecting_type(&VType::Long, context)?;
            frame.push(VType::Long, node);
        }

        FAdd | FSub | FDiv | FMul | FRem => {
            frame.pop_expecting_type(&VType::Float, context)?;
            frame.pop_expecting_type(&VType::Float, context)?;
            frame.push(VType::Float, node);
        }

        DAdd | DSub | DDiv | DMul | DRem => {
            frame.pop_expecting_type(&VType::Double, context)?;
            frame.pop_expecting_type(&VType::Double, context)?;
            frame.push(VType::Double, node);
        }

        INeg | I2B | I2C | I2S => {
            frame.pop_expecting_type(&VType::Integer, context)?;
            frame.push(VType::Integer, node);
        }
        LNeg => {
            frame.pop_expecting_type(&VType::Long, context)?;
            frame.push(VType::Long, node);
        }
        FNeg => {
            frame.pop_expecting_type(&VType::Float, context)?;
            frame.push(VType::Float, node);
        }
        DNeg => {
            frame.pop_expecting_type(&VType::Double, context)?;
            frame.push(VType::Double, node);
        }

        LSh(_) => {
            frame.pop_expecting_type(&VType::Integer, context)?;
            frame.pop_expecting_type(&VType::Long, context)?;
            frame.push(VType::Long, node);
        }

        IInc(index, _) => frame.load(*index, &VType::Integer)?,

        I2L | I2F | I2D | L2I | L2F | L2D | F2I | F2L | F2D | D2I | D2L | D2F => {
            let (from, to) = match insn {
                I2L => (VType::Integer, VType::Long),
                I2F => (VType::Integer, VType::Float),
                I2D => (VType::Integer, VType::Double),
                L2I => (VType::Long, VType::Integer),
                L2F => (VType::Long, VType::Float),
                L2D => (VType::Long, VType::Double),
                F2I => (VType::Float, VType::Integer),
                F2L => (VType::Float, VType::Long),
                F2D => (VType::Float, VType::Double),
                D2I => (VType::Double, VType::Integer),
                D2L => (VType::Double, VType::Long),
                _ => (VType::Double, VType::Float),
            };
            frame.pop_expecting_type(&from, context)?;
            frame.push(to, node);
        }

        LCmp => {
            frame.pop_expecting_type(&VType::Long, context)?;
            frame.pop_expecting_type(&VType::Long, context)?;
            frame.push(VType::Integer, node);
        }
        FCmp(_) => {
            frame.pop_expecting_type(&VType::Float, context)?;
            frame.pop_expecting_type(&VType::Float, context)?;
            frame.push(VType::Integer, node);
        }
        DCmp(_) => {
            frame.pop_expecting_type(&VType::Double, context)?;
            frame.pop_expecting_type(&VType::Double, context)?;
            frame.push(VType::Integer, node);
        }

        GetStatic(field) => {
            let field = constants.field_ref(*field).map_err(constant_error)?;
            frame.push(VType::from(field.descriptor), node);
        }
        PutStatic(field) => {
            let field = constants.field_ref(*field).map_err(constant_error)?;
            frame.pop_expecting_type(&VType::from(field.descriptor), context)?;
        }
        GetField(field) => {
            let field = constants.field_ref(*field).map_err(constant_error)?;
            frame.pop_expecting_type(&VType::object(field.owner), context)?;
            frame.push(VType::from(field.descriptor), node);
        }
        PutField(field) => {
            let field = constants.field_ref(*field).map_err(constant_error)?;
            frame.pop_expecting_type(&VType::from(field.descriptor), context)?;

            // Constructors may assign fields before calling the super constructor
            let receiver = frame.pop()?;
            if receiver.vtype != VType::UninitializedThis
                && !VType::is_assignable(
                    &receiver.vtype,
                    &VType::object(field.owner.clone()),
                    context.hierarchy,
                )
            {
                return Err(incompatible(&receiver.vtype, &VType::object(field.owner)));
            }
        }

        Invoke(invoke_type, method) => {
            let method = constants.method_ref(*method).map_err(constant_error)?;
            let is_init = method.name == UnqualifiedName::INIT;

            // Check that all the arguments match
            for expected_arg_type in method.descriptor.parameters.iter().rev() {
                let expected = VType::from(expected_arg_type.clone());
                let found = frame.pop()?;
                if !VType::is_assignable(&found.vtype, &expected, context.hierarchy) {
                    log::debug!(
                        "Incompatible argument types: found {:?} but expected {:?} (for {:?})",
                        found.vtype,
                        expected,
                        method.name,
                    );
                    return Err(incompatible(&found.vtype, &expected));
                }
            }

            if let (InvokeType::Special, true) = (invoke_type, is_init) {
                // Initialize
                match frame.pop()?.vtype {
                    VType::UninitializedThis => {
                        let initialized = VType::object(context.this_class.clone());
                        frame.replace_all(&VType::UninitializedThis, &initialized);
                    }

                    uninitialized @ VType::Uninitialized(_) => {
                        let initialized = VType::Object(method.owner.clone());
                        frame.replace_all(&uninitialized, &initialized);
                    }

                    _ => return Err(VerifierErrorKind::InvalidType),
                }

                if method.descriptor.return_type.is_some() {
                    return Err(VerifierErrorKind::InvalidType);
                }
            } else {
                // Pop off the receiver type
                if !matches!(invoke_type, InvokeType::Static) {
                    let expected = VType::Object(method.owner.clone());
                    let found = frame.pop()?;
                    if !VType::is_assignable(&found.vtype, &expected, context.hierarchy) {
                        log::debug!(
                            "Incompatible receiver: found {:?} but expected {:?} (for {:?})",
                            found.vtype,
                            expected,
                            method.name,
                        );
                        return Err(incompatible(&found.vtype, &expected));
                    }
                }

                // Push the return type
                if let Some(return_type) = method.descriptor.return_type {
                    frame.push(VType::from(return_type), node);
                }
            }
        }

        InvokeDynamic(index) => {
            let (_, descriptor) = constants.invoke_dynamic(*index).map_err(constant_error)?;

            // Check that all the arguments match
            for expected_arg_type in descriptor.parameters.iter().rev() {
                frame.pop_expecting_type(&VType::from(expected_arg_type.clone()), context)?;
            }

            // Push the return type
            if let Some(return_type) = descriptor.return_type {
                frame.push(VType::from(return_type), node);
            }
        }

        New(class) => {
            match constants.class(*class).map_err(constant_error)? {
                RefType::Object(_) => frame.push(VType::Uninitialized(node), node),
                _ => return Err(VerifierErrorKind::InvalidType),
            };
        }
        NewArray(base_type) => {
            frame.pop_expecting_type(&VType::Integer, context)?;
            frame.push(primitive_array(*base_type), node);
        }
        ANewArray(class) => {
            let element_type = constants.class(*class).map_err(constant_error)?;
            frame.pop_expecting_type(&VType::Integer, context)?;
            frame.push(
                VType::Object(RefType::array(FieldType::Ref(element_type))),
                node,
            );
        }
        MultiANewArray(class, dimensions) => {
            let array_type = constants.class(*class).map_err(constant_error)?;
            if *dimensions == 0 {
                return Err(VerifierErrorKind::InvalidIndex);
            }
            for _ in 0..*dimensions {
                frame.pop_expecting_type(&VType::Integer, context)?;
            }
            frame.push(VType::Object(array_type), node);
        }
        ArrayLength => {
            match frame.pop()?.vtype {
                VType::Null
                | VType::Object(RefType::PrimitiveArray(_) | RefType::ObjectArray(_)) => (),
                _ => return Err(VerifierErrorKind::NotArrayType),
            }
            frame.push(VType::Integer, node);
        }

        CheckCast(class) => {
            let class = constants.class(*class).map_err(constant_error)?;
            frame.pop_reference()?;
            frame.push(VType::Object(class), node);
        }
        InstanceOf(_) => {
            frame.pop_reference()?;
            frame.push(VType::Integer, node);
        }

        MonitorEnter | MonitorExit => {
            frame.pop_reference()?;
        }
    }

    Ok(())
}

fn verify_branch_instruction<Lbl, LblWide>(
    frame: &mut VerifierFrame,
    insn: &BranchInstruction<Lbl, LblWide>,
    context: &MethodContext,
) -> Result<(), VerifierErrorKind> {
    use BranchInstruction::*;

    let return_type = &context.descriptor.return_type;
    let returns = |expected: VType| match return_type {
        Some(field_type) => VType::from(field_type.clone()) == expected,
        None => false,
    };

    match insn {
        If(_, _) => {
            frame.pop_expecting_type(&VType::Integer, context)?;
        }
        IfICmp(_, _) => {
            frame.pop_expecting_type(&VType::Integer, context)?;
            frame.pop_expecting_type(&VType::Integer, context)?;
        }
        IfACmp(_, _) => {
            frame.pop_reference()?;
            frame.pop_reference()?;
        }
        Goto(_) | GotoW(_) => (),
        TableSwitch { .. } | LookupSwitch { .. } => {
            frame.pop_expecting_type(&VType::Integer, context)?;
        }
        IReturn => {
            frame.pop_expecting_type(&VType::Integer, context)?;
            if !returns(VType::Integer) {
                return Err(VerifierErrorKind::InvalidType);
            }
        }
        LReturn => {
            frame.pop_expecting_type(&VType::Long, context)?;
            if !returns(VType::Long) {
                return Err(VerifierErrorKind::InvalidType);
            }
        }
        FReturn => {
            frame.pop_expecting_type(&VType::Float, context)?;
            if !returns(VType::Float) {
                return Err(VerifierErrorKind::InvalidType);
            }
        }
        DReturn => {
            frame.pop_expecting_type(&VType::Double, context)?;
            if !returns(VType::Double) {
                return Err(VerifierErrorKind::InvalidType);
            }
        }
        AReturn => match return_type {
            Some(FieldType::Ref(ref_type)) => {
                frame.pop_expecting_type(&VType::Object(ref_type.clone()), context)?;
            }
            _ => return Err(VerifierErrorKind::InvalidType),
        },
        Return => {
            if return_type.is_some() {
                return Err(VerifierErrorKind::InvalidType);
            }
            if context.is_constructor && frame.locals.first() == Some(&VType::UninitializedThis) {
                return Err(VerifierErrorKind::UninitializedThis);
            }
        }
        AThrow => {
            let throwable = VType::object(BinaryName::THROWABLE);
            let exception = frame.pop_expecting_type(&throwable, context)?;
            frame.stack.clear();
            frame.stack.push(exception);
        }
        IfNull(_, _) => {
            frame.pop_reference()?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::hierarchy::KnownClasses;
    use crate::jvm::{MethodDescriptor, Name};
    use Instruction::*;

    fn context<'a>(hierarchy: &'a KnownClasses) -> MethodContext<'a> {
        MethodContext {
            this_class: BinaryName::from_string(String::from("MyClass")).unwrap(),
            descriptor: MethodDescriptor {
                parameters: vec![FieldType::long(), FieldType::int()],
                return_type: None,
            },
            is_static: false,
            is_constructor: false,
            hierarchy,
        }
    }

    fn new_frame(stack: &[VType]) -> VerifierFrame {
        VerifierFrame {
            locals: vec![],
            stack: stack
                .iter()
                .enumerate()
                .map(|(idx, vtype)| StackValue {
                    vtype: vtype.clone(),
                    origin: Some(idx),
                })
                .collect(),
        }
    }

    fn stack_types(frame: &VerifierFrame) -> Vec<VType> {
        frame.stack.iter().map(|value| value.vtype.clone()).collect()
    }

    #[test]
    fn arithmetic() {
        let hierarchy = KnownClasses::with_java_lang();
        let context = context(&hierarchy);
        let constants = ConstantsPool::new();

        let binops = [
            (VType::Integer, vec![IAdd, ISub, IDiv, IMul, IRem, IAnd, IOr, IXor]),
            (VType::Long, vec![LAdd, LSub, LDiv, LMul, LRem, LAnd, LOr, LXor]),
            (VType::Float, vec![FAdd, FSub, FDiv, FMul, FRem]),
            (VType::Double, vec![DAdd, DSub, DDiv, DMul, DRem]),
        ];

        for (good_typ, instructions) in binops {
            for instruction in instructions {
                // Try a bunch of different types
                for typ in [
                    VType::Integer,
                    VType::Long,
                    VType::Float,
                    VType::Double,
                    VType::Null,
                ] {
                    let mut frame = new_frame(&[typ.clone(), typ.clone()]);
                    let result = frame.verify_instruction(&instruction, 7, &constants, &context);
                    if typ == good_typ {
                        assert!(result.is_ok(), "Verification of {:?}", instruction);
                        assert_eq!(stack_types(&frame), vec![typ.clone()]);
                        assert_eq!(frame.stack[0].origin, Some(7));
                    } else {
                        assert!(
                            matches!(result, Err(VerifierErrorKind::IncompatibleTypes(_, _))),
                            "Verification of {:?}",
                            instruction
                        );
                    }
                }

                // Try with a stack that is too small
                let mut frame = new_frame(&[good_typ.clone()]);
                assert!(
                    matches!(
                        frame.verify_instruction(&instruction, 0, &constants, &context),
                        Err(VerifierErrorKind::EmptyStack),
                    ),
                    "Verification of {:?}",
                    instruction
                );
            }
        }
    }

    #[test]
    fn dup_keeps_origins() {
        let hierarchy = KnownClasses::with_java_lang();
        let context = context(&hierarchy);
        let constants = ConstantsPool::new();

        let mut frame = new_frame(&[VType::Integer, VType::Long]);
        frame.verify_instruction(&Dup2X1, 5, &constants, &context).unwrap();
        assert_eq!(
            stack_types(&frame),
            vec![VType::Long, VType::Integer, VType::Long]
        );
        let origins: Vec<_> = frame.stack.iter().map(|value| value.origin).collect();
        assert_eq!(origins, vec![Some(1), Some(0), Some(1)]);

        let mut frame = new_frame(&[VType::Long]);
        assert!(matches!(
            frame.verify_instruction(&Pop, 0, &constants, &context),
            Err(VerifierErrorKind::InvalidWidth(2))
        ));
    }

    #[test]
    fn locals_track_category_two_values() {
        let hierarchy = KnownClasses::with_java_lang();
        let context = context(&hierarchy);
        let constants = ConstantsPool::new();

        let mut frame = VerifierFrame::method_entry(&context);
        assert_eq!(
            frame.locals,
            vec![
                VType::object(context.this_class.clone()),
                VType::Long,
                VType::Top,
                VType::Integer
            ]
        );

        frame.verify_instruction(&LLoad(1), 0, &constants, &context).unwrap();
        frame.verify_instruction(&LStore(4), 1, &constants, &context).unwrap();
        assert_eq!(frame.locals.len(), 6);

        // Clobbering the upper half invalidates the `long`
        frame.verify_instruction(&IConst0, 2, &constants, &context).unwrap();
        frame.verify_instruction(&IStore(2), 3, &constants, &context).unwrap();
        assert_eq!(frame.local(1), None);
        assert!(frame.verify_instruction(&LLoad(1), 4, &constants, &context).is_err());
        assert!(frame.verify_instruction(&LLoad(4), 5, &constants, &context).is_ok());
    }

    #[test]
    fn merging_frames() {
        let hierarchy = KnownClasses::with_java_lang();
        let context = context(&hierarchy);

        let mut first = new_frame(&[VType::object(BinaryName::EXCEPTION)]);
        first.locals = vec![VType::Integer, VType::Float];
        let mut second = new_frame(&[VType::object(BinaryName::ERROR)]);
        second.locals = vec![VType::Integer, VType::Integer];
        second.stack[0].origin = Some(4);

        assert!(first.merge(&second, &context).unwrap());
        assert_eq!(stack_types(&first), vec![VType::object(BinaryName::THROWABLE)]);
        assert_eq!(first.stack[0].origin, None);
        assert_eq!(first.locals, vec![VType::Integer, VType::Top]);
        assert!(!first.merge(&second, &context).unwrap());

        let deeper = new_frame(&[VType::Integer, VType::Integer]);
        assert!(matches!(
            first.merge(&deeper, &context),
            Err(VerifierErrorKind::StackHeightMismatch(1, 2))
        ));
    }

    #[test]
    fn compact_stack_map_frames() {
        let previous: Frame<ClassConstantIndex, u16> = Frame {
            locals: OffsetVec::from([VerificationType::Integer]),
            stack: OffsetVec::new(),
        };
        let same = previous.clone();
        assert!(matches!(
            same.stack_map_frame(3, &previous),
            StackMapFrame::SameLocalsNoStack { offset_delta: 3 }
        ));

        let appended = Frame {
            locals: OffsetVec::from([VerificationType::Integer, VerificationType::Long]),
            stack: OffsetVec::new(),
        };
        match appended.stack_map_frame(1, &previous) {
            StackMapFrame::AppendLocalsNoStack { locals, .. } => {
                assert_eq!(locals, vec![VerificationType::Long])
            }
            other => panic!("unexpected frame {:?}", other),
        }

        let chopped = Frame {
            locals: OffsetVec::new(),
            stack: OffsetVec::new(),
        };
        assert!(matches!(
            chopped.stack_map_frame(1, &previous),
            StackMapFrame::ChopLocalsNoStack { chopped_k: 1, .. }
        ));

        let one_stack = Frame {
            locals: previous.locals.clone(),
            stack: OffsetVec::from([VerificationType::Null]),
        };
        assert!(matches!(
            one_stack.stack_map_frame(1, &previous),
            StackMapFrame::SameLocalsOneStack {
                stack: VerificationType::Null,
                ..
            }
        ));
    }
}
