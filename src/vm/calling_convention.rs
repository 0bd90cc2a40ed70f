// This module implements the internal calling convention of the VM. It provides the
// CCAssigner trait and the VmAssigner implementation that hand out argument and return
// locations: integer-class arguments (integers, bools, pointers) go to r0..r5, float
// arguments go to f0..f5, and everything else, including values that do not fit a single
// register and arguments left over once the registers run out, goes to 8-byte aligned
// stack slots above the frame header. The header holds the return address and, when the
// return type does not fit a register, a slot for the pointer to the caller's return
// buffer. CallLayout runs a fresh assigner over a signature, so the layout is recomputed
// identically every time it is asked for and no state is shared between calls.

//! Calling convention for calls between generated functions.

use crate::core::{AsmReg, RegBank, Signature, Type, WORD_SIZE};

/// Offset of the return address inside a frame.
pub const RETURN_ADDRESS_OFFSET: u32 = 0;

/// Offset of the return-buffer pointer for functions returning wide values.
pub const RETURN_POINTER_OFFSET: u32 = 8;

/// Class an argument is assigned by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgClass {
    /// Integers, bools and pointers.
    Integer,
    Float,
    /// Anything passed in memory.
    Memory,
}

impl ArgClass {
    pub fn of(ty: &Type) -> Self {
        if ty.is_float() && ty.fits_register() {
            ArgClass::Float
        } else if (ty.is_integer() || ty.is_pointer()) && ty.fits_register() {
            ArgClass::Integer
        } else {
            ArgClass::Memory
        }
    }
}

/// Argument assignment result from calling convention analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CCAssignment {
    pub class: ArgClass,
    /// Size of the argument in bytes.
    pub size: u32,
    /// Assigned register (if any).
    pub reg: Option<AsmReg>,
    /// Offset inside the callee frame (if assigned to the stack).
    pub stack_off: Option<u32>,
}

impl CCAssignment {
    pub fn new(class: ArgClass, size: u32) -> Self {
        Self {
            class,
            size,
            reg: None,
            stack_off: None,
        }
    }

    pub fn for_type(ty: &Type) -> Self {
        Self::new(ArgClass::of(ty), ty.size() as u32)
    }
}

/// Trait for calling convention argument assignment.
pub trait CCAssigner {
    /// Assign an argument according to the calling convention.
    fn assign_arg(&mut self, arg: &mut CCAssignment);

    /// Assign a return value according to the calling convention.
    fn assign_ret(&mut self, arg: &mut CCAssignment);

    /// Reset state for a new signature.
    fn reset(&mut self);

    /// End of the argument area inside the callee frame.
    fn get_stack_size(&self) -> u32;
}

/// Assigner for the VM's internal convention.
#[derive(Debug, Clone)]
pub struct VmAssigner {
    header: u32,
    int_cnt: usize,
    float_cnt: usize,
    stack: u32,
}

impl VmAssigner {
    const INT_ARG_REGS: usize = 6;
    const FLOAT_ARG_REGS: usize = 6;

    /// Create an assigner for a callee with the given frame header size.
    pub fn new(header: u32) -> Self {
        Self {
            header,
            int_cnt: 0,
            float_cnt: 0,
            stack: header,
        }
    }

    fn align_up(value: u32, align: u32) -> u32 {
        (value + align - 1) & !(align - 1)
    }

    fn assign_stack(&mut self, arg: &mut CCAssignment) {
        self.stack = Self::align_up(self.stack, WORD_SIZE as u32);
        arg.stack_off = Some(self.stack);
        self.stack += Self::align_up(arg.size.max(1), WORD_SIZE as u32);
    }
}

impl CCAssigner for VmAssigner {
    fn assign_arg(&mut self, arg: &mut CCAssignment) {
        match arg.class {
            ArgClass::Integer if self.int_cnt < Self::INT_ARG_REGS => {
                arg.reg = Some(AsmReg::int(self.int_cnt as u8));
                self.int_cnt += 1;
            }
            ArgClass::Float if self.float_cnt < Self::FLOAT_ARG_REGS => {
                arg.reg = Some(AsmReg::float(self.float_cnt as u8));
                self.float_cnt += 1;
            }
            _ => self.assign_stack(arg),
        }
    }

    fn assign_ret(&mut self, arg: &mut CCAssignment) {
        arg.reg = match arg.class {
            ArgClass::Float => Some(AsmReg::float(0)),
            ArgClass::Integer => Some(AsmReg::int(0)),
            ArgClass::Memory => None,
        };
    }

    fn reset(&mut self) {
        self.int_cnt = 0;
        self.float_cnt = 0;
        self.stack = self.header;
    }

    fn get_stack_size(&self) -> u32 {
        self.stack
    }
}

/// Where one argument travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgLocation {
    Register(AsmReg),
    /// Forward offset inside the callee frame.
    Stack(u32),
}

/// How a function hands back its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnLocation {
    Void,
    Register(AsmReg),
    /// Written through the pointer stored at [`RETURN_POINTER_OFFSET`].
    Memory,
}

/// Argument and return placement for one signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallLayout {
    pub args: Vec<ArgLocation>,
    pub ret: ReturnLocation,
    /// Frame header size: return address plus optional return pointer.
    pub header_size: u32,
    /// End of the parameter area; callee locals start here.
    pub param_area_end: u32,
}

impl CallLayout {
    pub fn for_signature(signature: &Signature) -> Self {
        let ret = if signature.ret.is_void() {
            ReturnLocation::Void
        } else {
            let mut ret = CCAssignment::for_type(&signature.ret);
            // Wide and aggregate results go through memory; small structs come back in r0.
            if signature.ret.is_struct() && signature.ret.fits_register() {
                ret.class = ArgClass::Integer;
            }
            VmAssigner::new(0).assign_ret(&mut ret);
            ret.reg
                .map_or(ReturnLocation::Memory, ReturnLocation::Register)
        };
        let header_size = match ret {
            ReturnLocation::Memory => RETURN_POINTER_OFFSET + WORD_SIZE as u32,
            _ => RETURN_ADDRESS_OFFSET + WORD_SIZE as u32,
        };

        let mut assigner = VmAssigner::new(header_size);
        let args = signature
            .params
            .iter()
            .map(|ty| {
                let mut arg = CCAssignment::for_type(ty);
                assigner.assign_arg(&mut arg);
                match (arg.reg, arg.stack_off) {
                    (Some(reg), _) => ArgLocation::Register(reg),
                    (None, Some(off)) => ArgLocation::Stack(off),
                    (None, None) => ArgLocation::Stack(header_size),
                }
            })
            .collect();

        Self {
            args,
            ret,
            header_size,
            param_area_end: assigner.get_stack_size(),
        }
    }

    /// Register bank of the result register, if any.
    pub fn return_bank(&self) -> Option<RegBank> {
        match self.ret {
            ReturnLocation::Register(reg) => Some(reg.bank),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StructLayout;

    #[test]
    fn test_register_arguments() {
        let sig = Signature::new(
            vec![Type::i32(), Type::f64(), Type::pointer_to(Type::u8()), Type::f32()],
            Type::i64(),
        );
        let layout = CallLayout::for_signature(&sig);
        assert_eq!(
            layout.args,
            vec![
                ArgLocation::Register(AsmReg::int(0)),
                ArgLocation::Register(AsmReg::float(0)),
                ArgLocation::Register(AsmReg::int(1)),
                ArgLocation::Register(AsmReg::float(1)),
            ]
        );
        assert_eq!(layout.ret, ReturnLocation::Register(AsmReg::int(0)));
        assert_eq!(layout.header_size, 8);
        assert_eq!(layout.param_area_end, 8);
    }

    #[test]
    fn test_overflow_goes_to_stack() {
        let sig = Signature::new(vec![Type::u64(); 8], Type::void());
        let layout = CallLayout::for_signature(&sig);
        assert_eq!(layout.args[5], ArgLocation::Register(AsmReg::int(5)));
        assert_eq!(layout.args[6], ArgLocation::Stack(8));
        assert_eq!(layout.args[7], ArgLocation::Stack(16));
        assert_eq!(layout.param_area_end, 24);
        assert_eq!(layout.ret, ReturnLocation::Void);
    }

    #[test]
    fn test_wide_values_use_memory() {
        let pair = StructLayout::new(
            "Pair",
            vec![("a".into(), Type::u64()), ("b".into(), Type::u64())],
        );
        let sig = Signature::new(
            vec![Type::structure(pair.clone()), Type::u8()],
            Type::structure(pair),
        );
        let layout = CallLayout::for_signature(&sig);
        assert_eq!(layout.ret, ReturnLocation::Memory);
        assert_eq!(layout.header_size, 16);
        assert_eq!(layout.args[0], ArgLocation::Stack(16));
        assert_eq!(layout.args[1], ArgLocation::Register(AsmReg::int(0)));
        assert_eq!(layout.param_area_end, 32);
    }

    #[test]
    fn test_layout_is_recomputed_identically() {
        let sig = Signature::new(vec![Type::f64(), Type::i8()], Type::f32());
        assert_eq!(CallLayout::for_signature(&sig), CallLayout::for_signature(&sig));
        assert_eq!(
            CallLayout::for_signature(&sig).return_bank(),
            Some(RegBank::Float)
        );
    }
}
