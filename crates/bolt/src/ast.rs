//! Typed AST
//!
//! Nodes come out of the parser already typed: `ty` holds the expression's
//! resulting type the moment the node is built. Binary operations carry the
//! flags the compiler turns into fast paths — `accelerated` for statically
//! numeric operations, `hoistable` plus a source type and key for dot
//! accesses on final sealed shapes.

use crate::tokenizer::Token;
use crate::types::TypeObj;
use crate::value::Value;

#[derive(Clone)]
pub struct FnArg {
    pub name: String,
    pub ty: *mut TypeObj,
}

/// A named binding introduced at parse time. Type aliases bind with
/// `ty == Type` and carry the aliased type in `alias`.
#[derive(Clone)]
pub struct ParseBinding {
    pub name: String,
    pub ty: *mut TypeObj,
    pub is_const: bool,
    pub alias: *mut TypeObj,
}

pub struct TableField {
    pub key: Value,
    pub value_ty: *mut TypeObj,
    pub expr: AstNode,
}

pub struct IfBranch {
    /// None for a trailing `else`.
    pub condition: Option<Box<AstNode>>,
    /// `if let x = expr` binds the non-null part of `expr` inside the body.
    pub is_let: bool,
    pub let_name: Option<String>,
    pub bound_ty: *mut TypeObj,
    pub body: Vec<AstNode>,
    pub next: Option<Box<AstNode>>,
}

pub enum AstKind {
    Module {
        body: Vec<AstNode>,
    },

    /// Payload lives in the token's literal slot.
    Literal,
    EnumLiteral {
        value: Value,
    },
    Identifier,
    /// An identifier resolved into the module's import list.
    ImportRef {
        index: u32,
    },
    /// A type expression used as a value (`as T`, `is T`, `typeof x`).
    TypeLiteral {
        ty: *mut TypeObj,
    },

    Array {
        items: Vec<AstNode>,
    },
    Table {
        fields: Vec<TableField>,
        /// Set when the literal was checked against a declared shape;
        /// construction then attaches the shape's prototype directly.
        shape: *mut TypeObj,
    },

    Function {
        args: Vec<FnArg>,
        body: Vec<AstNode>,
        /// Bindings captured from enclosing functions, in capture order.
        upvals: Vec<ParseBinding>,
        ret: *mut TypeObj,
    },
    /// `fn Type.name(...)` / `method Type.name(...)`: attach a member to a
    /// type at module run time.
    Method {
        receiver: *mut TypeObj,
        key: Value,
        func: Box<AstNode>,
    },

    BinaryOp {
        left: Box<AstNode>,
        right: Box<AstNode>,
        accelerated: bool,
        /// Dot access on a final sealed shape: the compiler may replace the
        /// load with the resolved constant.
        hoistable: bool,
        from: *mut TypeObj,
        key: Value,
        /// Own-pair index for accelerated field access.
        idx: u8,
    },
    UnaryOp {
        operand: Box<AstNode>,
        accelerated: bool,
    },

    Let {
        name: String,
        is_const: bool,
        initializer: Option<Box<AstNode>>,
    },
    /// `type name = T`; compile-time only unless exported.
    Alias {
        name: String,
        ty: *mut TypeObj,
    },
    Return {
        expr: Option<Box<AstNode>>,
    },
    If(IfBranch),
    LoopWhile {
        condition: Box<AstNode>,
        body: Vec<AstNode>,
    },
    LoopIterator {
        var_name: String,
        var_ty: *mut TypeObj,
        iterator: Box<AstNode>,
        body: Vec<AstNode>,
    },
    LoopNumeric {
        var_name: String,
        start: Box<AstNode>,
        stop: Box<AstNode>,
        step: Option<Box<AstNode>>,
        body: Vec<AstNode>,
    },
    Call {
        callee: Box<AstNode>,
        args: Vec<AstNode>,
        /// Dot-call sugar resolved to a method: the receiver becomes the
        /// silent first argument.
        is_methodcall: bool,
        /// The concrete signature the call was checked against (poly calls
        /// resolve to a synthesized one).
        sig: *mut TypeObj,
    },
    Export {
        key: Value,
        ty: *mut TypeObj,
        inner: Box<AstNode>,
    },
    Break,
    Continue,
}

pub struct AstNode {
    pub kind: AstKind,
    pub source: Token,
    /// Resulting type, filled in during parse.
    pub ty: *mut TypeObj,
}

impl AstNode {
    pub fn new(kind: AstKind, source: Token) -> AstNode {
        AstNode {
            kind,
            source,
            ty: std::ptr::null_mut(),
        }
    }

    pub fn typed(kind: AstKind, source: Token, ty: *mut TypeObj) -> AstNode {
        AstNode { kind, source, ty }
    }

    pub fn is_identifier(&self) -> bool {
        matches!(self.kind, AstKind::Identifier)
    }
}
