//! Parser and Type Checker
//!
//! A single pass over the token stream: recursive descent at statement
//! level, Pratt parsing for expressions, with types resolved and checked as
//! nodes are built. Identifier resolution walks the scope stack, records
//! upvalues in every function boundary it crosses, then falls back to the
//! module's imports and finally the context prelude.
//!
//! Errors are delivered through the host error callback; parsing continues
//! best-effort but a failed parse reports `false`.

use crate::ast::{
    AstKind, AstNode, FnArg, IfBranch, ParseBinding, TableField,
};
use crate::context::{Context, ErrorKind};
use crate::object::{
    Obj, StringObj, make_string_hashed, table_get, value_is_equal,
};
use crate::tokenizer::{Literal, Token, TokenKind, Tokenizer};
use crate::types::{
    self, TypeCategory, TypeData, TypeObj, dealias, type_name, type_satisfies,
};
use crate::value::{VALUE_NULL, Value};

struct Scope {
    bindings: Vec<ParseBinding>,
    is_fn_boundary: bool,
}

/// Per-function state while its literal is being parsed.
struct FnFrame {
    upvals: Vec<ParseBinding>,
    declared_ret: *mut TypeObj,
    has_declared_ret: bool,
}

enum Resolution {
    Local(ParseBinding),
    Upvalue(ParseBinding),
    Import(u32, *mut TypeObj),
    Unknown,
}

pub struct Parser {
    pub tokenizer: Tokenizer,
    pub root: Option<AstNode>,
    /// Module import list, in first-mention order.
    pub imports: Vec<*mut crate::object::ImportObj>,
    scopes: Vec<Scope>,
    fn_frames: Vec<FnFrame>,
    has_errored: bool,
}

impl Parser {
    pub fn new(tokenizer: Tokenizer) -> Parser {
        Parser {
            tokenizer,
            root: None,
            imports: Vec::new(),
            scopes: Vec::new(),
            fn_frames: Vec::new(),
            has_errored: false,
        }
    }

    pub fn parse(&mut self, ctx: &mut Context) -> bool {
        self.push_scope(false);
        let mut body = Vec::new();

        loop {
            let token = self.tokenizer.peek();
            if token.kind == TokenKind::Eos {
                break;
            }
            match self.parse_statement(ctx) {
                Some(node) => body.push(node),
                None => {
                    // Drop one token so a malformed statement cannot wedge
                    // the loop, then try the next statement.
                    if self.tokenizer.peek().kind != TokenKind::Eos {
                        self.tokenizer.emit();
                    }
                }
            }
        }

        self.pop_scope();

        let eos = Token {
            kind: TokenKind::Eos,
            line: 1,
            col: 0,
            literal: 0,
            start: 0,
            len: 0,
        };
        self.root = Some(AstNode::new(AstKind::Module { body }, eos));

        !self.has_errored
    }

    // -----------------------------------------------------------------------
    // Diagnostics
    // -----------------------------------------------------------------------

    fn error(&mut self, ctx: &mut Context, message: &str, token: &Token) -> Option<AstNode> {
        let name = self.tokenizer.source_name.clone();
        ctx.report_error(ErrorKind::Parse, &name, message, token.line, token.col);
        self.has_errored = true;
        None
    }

    fn error_ty(&mut self, ctx: &mut Context, message: &str, token: &Token) -> Option<*mut TypeObj> {
        self.error(ctx, message, token);
        None
    }

    // -----------------------------------------------------------------------
    // Scopes and bindings
    // -----------------------------------------------------------------------

    fn push_scope(&mut self, is_fn_boundary: bool) {
        self.scopes.push(Scope {
            bindings: Vec::new(),
            is_fn_boundary,
        });
    }

    fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    fn push_binding(&mut self, binding: ParseBinding) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.bindings.push(binding);
        }
    }

    fn find_in_current_scope(&self, name: &str) -> bool {
        self.scopes
            .last()
            .map(|s| s.bindings.iter().any(|b| b.name == name))
            .unwrap_or(false)
    }

    /// Resolution order: locals up to the nearest function boundary, the
    /// current function's recorded upvalues, outer scopes (recording the
    /// binding as an upvalue in every crossed function), module imports,
    /// then the context prelude.
    fn resolve(&mut self, ctx: &mut Context, name: &str) -> Resolution {
        let mut crossed = 0usize;

        for scope in self.scopes.iter().rev() {
            if crossed == 0 || crossed <= self.fn_frames.len() {
                if let Some(binding) = scope.bindings.iter().rev().find(|b| b.name == name) {
                    if crossed == 0 {
                        return Resolution::Local(binding.clone());
                    }

                    // Record the capture in every crossed function, once.
                    let binding = binding.clone();
                    let frames = self.fn_frames.len();
                    for frame_idx in (frames - crossed.min(frames)..frames).rev() {
                        let frame = &mut self.fn_frames[frame_idx];
                        if !frame.upvals.iter().any(|u| u.name == name) {
                            frame.upvals.push(binding.clone());
                        }
                    }
                    return Resolution::Upvalue(binding);
                }
            }

            if scope.is_fn_boundary {
                if crossed == 0 {
                    // Before walking past the boundary, a capture already
                    // recorded by this function wins.
                    if let Some(frame) = self.fn_frames.last() {
                        if let Some(upval) = frame.upvals.iter().find(|u| u.name == name) {
                            return Resolution::Upvalue(upval.clone());
                        }
                    }
                }
                crossed += 1;
            }
        }

        // Module imports.
        for (idx, import) in self.imports.iter().enumerate() {
            unsafe {
                if (*(**import).name).as_str() == name {
                    return Resolution::Import(idx as u32, (**import).ty);
                }
            }
        }

        // Context prelude: first mention pulls the entry into the imports.
        if let Some(entry) = ctx.find_prelude(name) {
            let idx = self.imports.len() as u32;
            self.imports.push(entry);
            let ty = unsafe { (*entry).ty };
            return Resolution::Import(idx, ty);
        }

        Resolution::Unknown
    }

    fn token_text(&self, token: &Token) -> String {
        self.tokenizer.token_text(token).to_string()
    }

    // -----------------------------------------------------------------------
    // Statements
    // -----------------------------------------------------------------------

    fn parse_statement(&mut self, ctx: &mut Context) -> Option<AstNode> {
        let token = self.tokenizer.peek();
        match token.kind {
            TokenKind::Import => {
                self.tokenizer.emit();
                self.parse_import(ctx)
            }
            TokenKind::Export => {
                self.tokenizer.emit();
                self.parse_export(ctx)
            }
            TokenKind::Let => {
                self.tokenizer.emit();
                self.parse_let(ctx, false)
            }
            TokenKind::Var => {
                self.tokenizer.emit();
                self.parse_let(ctx, true)
            }
            TokenKind::Return => {
                self.tokenizer.emit();
                self.parse_return(ctx, token)
            }
            TokenKind::Fn => {
                self.tokenizer.emit();
                self.parse_function_statement(ctx, token)
            }
            TokenKind::Method => {
                self.tokenizer.emit();
                self.parse_method_statement(ctx, token)
            }
            TokenKind::If => {
                self.tokenizer.emit();
                self.parse_if(ctx, token)
            }
            TokenKind::For => {
                self.tokenizer.emit();
                self.parse_for(ctx, token)
            }
            TokenKind::Type => {
                self.tokenizer.emit();
                self.parse_alias(ctx)
            }
            TokenKind::Break => {
                self.tokenizer.emit();
                Some(AstNode::new(AstKind::Break, token))
            }
            TokenKind::Continue => {
                self.tokenizer.emit();
                Some(AstNode::new(AstKind::Continue, token))
            }
            _ => self.pratt_parse(ctx, 0),
        }
    }

    fn parse_block(&mut self, ctx: &mut Context) -> Option<Vec<AstNode>> {
        if let Err(e) = self.tokenizer.expect(TokenKind::LeftBrace) {
            let token = self.tokenizer.peek();
            self.error(ctx, &e, &token);
            return None;
        }

        let mut body = Vec::new();
        loop {
            let token = self.tokenizer.peek();
            match token.kind {
                TokenKind::RightBrace => {
                    self.tokenizer.emit();
                    break;
                }
                TokenKind::Eos => {
                    self.error(ctx, "unexpected end of source inside block", &token);
                    return None;
                }
                _ => match self.parse_statement(ctx) {
                    Some(stmt) => body.push(stmt),
                    None => {
                        if self.tokenizer.peek().kind != TokenKind::Eos {
                            self.tokenizer.emit();
                        }
                    }
                },
            }
        }

        Some(body)
    }

    fn parse_let(&mut self, ctx: &mut Context, is_var: bool) -> Option<AstNode> {
        let mut is_const = false;
        let mut name_token = self.tokenizer.emit();
        if name_token.kind == TokenKind::Const {
            is_const = true;
            name_token = self.tokenizer.emit();
        }
        if name_token.kind != TokenKind::Identifier {
            return self.error(ctx, "expected binding name", &name_token);
        }
        let name = self.token_text(&name_token);
        if self.find_in_current_scope(&name) {
            return self.error(ctx, &format!("duplicate binding '{}'", name), &name_token);
        }

        let mut declared: *mut TypeObj = std::ptr::null_mut();
        if !is_var && self.tokenizer.peek().kind == TokenKind::Colon {
            self.tokenizer.emit();
            declared = self.parse_type(ctx)?;
        }

        let mut initializer = None;
        if self.tokenizer.peek().kind == TokenKind::Assign {
            self.tokenizer.emit();
            let expected = if is_var { ctx.types.any } else { declared };
            let expr = self.parse_expression_expecting(ctx, expected)?;
            initializer = Some(Box::new(expr));
        }

        let binding_ty = if is_var {
            ctx.types.any
        } else if !declared.is_null() {
            if let Some(init) = &initializer {
                if !type_satisfies(declared, init.ty) {
                    return self.error(
                        ctx,
                        &format!(
                            "initializer of type '{}' does not satisfy declared type '{}'",
                            type_name(init.ty),
                            type_name(declared)
                        ),
                        &name_token,
                    );
                }
            }
            declared
        } else {
            match &initializer {
                Some(init) if !init.ty.is_null() => init.ty,
                _ => {
                    return self.error(
                        ctx,
                        &format!("binding '{}' needs a type or an initializer", name),
                        &name_token,
                    );
                }
            }
        };

        self.push_binding(ParseBinding {
            name: name.clone(),
            ty: binding_ty,
            is_const,
            alias: std::ptr::null_mut(),
        });

        Some(AstNode::typed(
            AstKind::Let {
                name,
                is_const,
                initializer,
            },
            name_token,
            binding_ty,
        ))
    }

    fn parse_return(&mut self, ctx: &mut Context, token: Token) -> Option<AstNode> {
        let next = self.tokenizer.peek();
        let expr = match next.kind {
            TokenKind::RightBrace | TokenKind::Eos => None,
            _ => Some(Box::new(self.pratt_parse(ctx, 0)?)),
        };

        if let Some(frame) = self.fn_frames.last() {
            if frame.has_declared_ret {
                let declared = frame.declared_ret;
                let actual = expr.as_ref().map(|e| e.ty).unwrap_or(std::ptr::null_mut());
                if declared.is_null() != actual.is_null()
                    || (!declared.is_null() && !type_satisfies(declared, actual))
                {
                    return self.error(
                        ctx,
                        &format!(
                            "return of type '{}' does not satisfy declared return type '{}'",
                            type_name(actual),
                            type_name(declared)
                        ),
                        &token,
                    );
                }
            }
        }

        let ty = expr.as_ref().map(|e| e.ty).unwrap_or(std::ptr::null_mut());
        Some(AstNode::typed(AstKind::Return { expr }, token, ty))
    }

    fn parse_import(&mut self, ctx: &mut Context) -> Option<AstNode> {
        let first = self.tokenizer.emit();

        // import * from M
        if first.kind == TokenKind::Mul {
            if let Err(e) = self.tokenizer.expect(TokenKind::From) {
                return self.error(ctx, &e, &first);
            }
            let mod_token = self.tokenizer.emit();
            if mod_token.kind != TokenKind::Identifier {
                return self.error(ctx, "expected module name after 'from'", &mod_token);
            }
            return self.parse_import_star(ctx, mod_token);
        }

        if first.kind != TokenKind::Identifier {
            return self.error(ctx, "expected module or import name after 'import'", &first);
        }
        let first_name = self.token_text(&first);

        let next = self.tokenizer.peek();
        match next.kind {
            // import a, b, … from M
            TokenKind::Comma | TokenKind::From => {
                let mut names = vec![(first_name, first)];
                while self.tokenizer.peek().kind == TokenKind::Comma {
                    self.tokenizer.emit();
                    let t = self.tokenizer.emit();
                    if t.kind != TokenKind::Identifier {
                        return self.error(ctx, "expected import name", &t);
                    }
                    names.push((self.token_text(&t), t));
                }
                if let Err(e) = self.tokenizer.expect(TokenKind::From) {
                    return self.error(ctx, &e, &first);
                }
                let mod_token = self.tokenizer.emit();
                if mod_token.kind != TokenKind::Identifier {
                    return self.error(ctx, "expected module name after 'from'", &mod_token);
                }
                let mod_name = self.token_text(&mod_token);
                let module = match ctx.find_module(&mod_name) {
                    Some(m) => m,
                    None => {
                        return self.error(
                            ctx,
                            &format!("cannot find module '{}'", mod_name),
                            &mod_token,
                        );
                    }
                };

                for (name, token) in names {
                    let key = make_string_hashed(ctx, &name);
                    let value = crate::object::module_get_export(module, Value::object(key as *mut Obj));
                    let ty = crate::object::module_get_export_type(module, Value::object(key as *mut Obj));
                    if ty.is_null() {
                        return self.error(
                            ctx,
                            &format!("module '{}' has no export '{}'", mod_name, name),
                            &token,
                        );
                    }
                    self.add_import(ctx, &name, ty, value);
                }
            }

            // import M [as alias]
            _ => {
                let mut bound_name = first_name.clone();
                if next.kind == TokenKind::As {
                    self.tokenizer.emit();
                    let alias = self.tokenizer.emit();
                    if alias.kind != TokenKind::Identifier {
                        return self.error(ctx, "expected name after 'as'", &alias);
                    }
                    bound_name = self.token_text(&alias);
                }

                let module = match ctx.find_module(&first_name) {
                    Some(m) => m,
                    None => {
                        return self.error(
                            ctx,
                            &format!("cannot find module '{}'", first_name),
                            &first,
                        );
                    }
                };
                let ty = unsafe { (*module).ty };
                self.add_import(ctx, &bound_name, ty, Value::object(module as *mut Obj));
            }
        }

        // Imports resolve at parse time; nothing remains to execute.
        Some(AstNode::new(AstKind::Module { body: Vec::new() }, first))
    }

    /// `import * from M` — every export becomes a named import.
    fn parse_import_star(&mut self, ctx: &mut Context, mod_token: Token) -> Option<AstNode> {
        let mod_name = self.token_text(&mod_token);
        let module = match ctx.find_module(&mod_name) {
            Some(m) => m,
            None => {
                return self.error(ctx, &format!("cannot find module '{}'", mod_name), &mod_token);
            }
        };

        unsafe {
            let exports = (*module).exports;
            let len = (*exports).pairs.len();
            for i in 0..len {
                let pair = (*exports).pairs.pairs()[i];
                let name_obj = pair.key.as_object() as *mut StringObj;
                let name = (*name_obj).as_str().to_string();
                let ty = crate::object::module_get_export_type(module, pair.key);
                self.add_import(ctx, &name, ty, pair.value);
            }
        }

        Some(AstNode::new(AstKind::Module { body: Vec::new() }, mod_token))
    }

    fn add_import(&mut self, ctx: &mut Context, name: &str, ty: *mut TypeObj, value: Value) {
        unsafe {
            if self
                .imports
                .iter()
                .any(|i| (*(**i).name).as_str() == name)
            {
                return;
            }
        }
        let key = make_string_hashed(ctx, name);
        let import = crate::object::make_import(ctx, key, ty, value);
        self.imports.push(import);
    }

    fn parse_export(&mut self, ctx: &mut Context) -> Option<AstNode> {
        let token = self.tokenizer.peek();
        let inner = self.parse_statement(ctx)?;

        let (name, ty) = match &inner.kind {
            AstKind::Let { name, .. } => (name.clone(), inner.ty),
            AstKind::Alias { name, .. } => (name.clone(), ctx.types.type_),
            _ => {
                return self.error(ctx, "only declarations can be exported", &token);
            }
        };

        let key = make_string_hashed(ctx, &name);
        Some(AstNode::typed(
            AstKind::Export {
                key: Value::object(key as *mut Obj),
                ty,
                inner: Box::new(inner),
            },
            token,
            ty,
        ))
    }

    fn parse_alias(&mut self, ctx: &mut Context) -> Option<AstNode> {
        let name_token = self.tokenizer.emit();
        if name_token.kind != TokenKind::Identifier {
            return self.error(ctx, "expected type name after 'type'", &name_token);
        }
        let name = self.token_text(&name_token);

        if let Err(e) = self.tokenizer.expect(TokenKind::Assign) {
            return self.error(ctx, &e, &name_token);
        }

        let ty = self.parse_type(ctx)?;
        unsafe {
            // Freshly built anonymous types take the alias's name; aliasing
            // an already-named type must not rename it.
            if (*ty).name.as_deref().is_none_or(|n| n.is_empty() || n == "enum") {
                (*ty).name = Some(name.clone());
            }
        }

        self.push_binding(ParseBinding {
            name: name.clone(),
            ty: ctx.types.type_,
            is_const: true,
            alias: ty,
        });

        Some(AstNode::typed(
            AstKind::Alias { name, ty },
            name_token,
            ctx.types.type_,
        ))
    }

    fn parse_function_statement(&mut self, ctx: &mut Context, token: Token) -> Option<AstNode> {
        let name_token = self.tokenizer.emit();
        if name_token.kind != TokenKind::Identifier {
            return self.error(ctx, "expected function or type name after 'fn'", &name_token);
        }

        // `fn Type.name(...)` attaches a member to a type.
        if self.tokenizer.peek().kind == TokenKind::Period {
            return self.parse_type_member_fn(ctx, name_token);
        }

        let name = self.token_text(&name_token);
        if self.find_in_current_scope(&name) {
            return self.error(ctx, &format!("duplicate binding '{}'", name), &name_token);
        }

        let func = self.parse_function_literal(ctx, token, Some(&name))?;

        self.push_binding(ParseBinding {
            name: name.clone(),
            ty: func.ty,
            is_const: true,
            alias: std::ptr::null_mut(),
        });

        let ty = func.ty;
        Some(AstNode::typed(
            AstKind::Let {
                name,
                is_const: true,
                initializer: Some(Box::new(func)),
            },
            name_token,
            ty,
        ))
    }

    fn parse_method_statement(&mut self, ctx: &mut Context, _token: Token) -> Option<AstNode> {
        let type_token = self.tokenizer.emit();
        if type_token.kind != TokenKind::Identifier {
            return self.error(ctx, "expected type name after 'method'", &type_token);
        }
        self.parse_type_member_fn(ctx, type_token)
    }

    /// Shared tail of `fn Type.name(...)` and `method Type.name(...)`.
    fn parse_type_member_fn(&mut self, ctx: &mut Context, type_token: Token) -> Option<AstNode> {
        let receiver = match self.resolve_type_identifier(ctx, &type_token) {
            Some(ty) => ty,
            None => {
                let text = self.token_text(&type_token);
                return self.error(ctx, &format!("unknown type '{}'", text), &type_token);
            }
        };

        if let Err(e) = self.tokenizer.expect(TokenKind::Period) {
            return self.error(ctx, &e, &type_token);
        }
        let name_token = self.tokenizer.emit();
        if name_token.kind != TokenKind::Identifier {
            return self.error(ctx, "expected member name", &name_token);
        }
        let member = self.token_text(&name_token);

        let func = self.parse_function_literal(ctx, name_token, Some(&member))?;

        // Members declared on a type are methods: dot-call sugar may pass
        // the receiver as the silent first argument.
        unsafe {
            if let TypeData::Signature { is_method, .. } = &mut (*func.ty).data {
                *is_method = true;
            }
        }

        // Register the member's type now so later dot accesses check; the
        // value itself is installed when the module runs.
        let key = make_string_hashed(ctx, &member);
        types::type_add_field_type(ctx, receiver, func.ty, Value::object(key as *mut Obj));

        let ty = func.ty;
        Some(AstNode::typed(
            AstKind::Method {
                receiver,
                key: Value::object(key as *mut Obj),
                func: Box::new(func),
            },
            name_token,
            ty,
        ))
    }

    /// Function literal: `fn [(args)] [: ret] { body }` or `=> expr`.
    fn parse_function_literal(
        &mut self,
        ctx: &mut Context,
        token: Token,
        self_name: Option<&str>,
    ) -> Option<AstNode> {
        let mut args = Vec::new();

        if self.tokenizer.peek().kind == TokenKind::LeftParen {
            self.tokenizer.emit();
            loop {
                let t = self.tokenizer.peek();
                match t.kind {
                    TokenKind::RightParen => {
                        self.tokenizer.emit();
                        break;
                    }
                    TokenKind::Identifier => {
                        self.tokenizer.emit();
                        let arg_name = self.token_text(&t);
                        if let Err(e) = self.tokenizer.expect(TokenKind::Colon) {
                            return self.error(ctx, &e, &t);
                        }
                        let arg_ty = self.parse_type(ctx)?;
                        args.push(FnArg {
                            name: arg_name,
                            ty: arg_ty,
                        });
                        if self.tokenizer.peek().kind == TokenKind::Comma {
                            self.tokenizer.emit();
                        }
                    }
                    _ => {
                        return self.error(ctx, "expected argument name or ')'", &t);
                    }
                }
            }
        }

        let mut declared_ret: *mut TypeObj = std::ptr::null_mut();
        let mut has_declared_ret = false;
        if self.tokenizer.peek().kind == TokenKind::Colon {
            self.tokenizer.emit();
            declared_ret = self.parse_type(ctx)?;
            has_declared_ret = true;
        }

        // Bind the function's own name ahead of the body so it can recurse;
        // the signature is provisional when the return type is inferred.
        let provisional_sig = {
            let arg_tys: Vec<*mut TypeObj> = args.iter().map(|a| a.ty).collect();
            types::make_signature(ctx, declared_ret, &arg_tys)
        };

        self.fn_frames.push(FnFrame {
            upvals: Vec::new(),
            declared_ret,
            has_declared_ret,
        });
        self.push_scope(true);

        if let Some(name) = self_name {
            self.push_binding(ParseBinding {
                name: name.to_string(),
                ty: provisional_sig,
                is_const: true,
                alias: std::ptr::null_mut(),
            });
        }
        for arg in &args {
            self.push_binding(ParseBinding {
                name: arg.name.clone(),
                ty: arg.ty,
                is_const: false,
                alias: std::ptr::null_mut(),
            });
        }

        let body = if self.tokenizer.peek().kind == TokenKind::FatArrow {
            self.tokenizer.emit();
            let expr = self.pratt_parse(ctx, 0);
            match expr {
                Some(expr) => {
                    let source = expr.source;
                    let ty = expr.ty;
                    vec![AstNode::typed(
                        AstKind::Return {
                            expr: Some(Box::new(expr)),
                        },
                        source,
                        ty,
                    )]
                }
                None => {
                    self.pop_scope();
                    self.fn_frames.pop();
                    return None;
                }
            }
        } else {
            match self.parse_block(ctx) {
                Some(body) => body,
                None => {
                    self.pop_scope();
                    self.fn_frames.pop();
                    return None;
                }
            }
        };

        self.pop_scope();
        let frame = self.fn_frames.pop().expect("frame pushed above");

        let ret = if has_declared_ret {
            declared_ret
        } else {
            infer_return(ctx, &body)
        };

        let sig = {
            let arg_tys: Vec<*mut TypeObj> = args.iter().map(|a| a.ty).collect();
            types::make_signature(ctx, ret, &arg_tys)
        };

        Some(AstNode::typed(
            AstKind::Function {
                args,
                body,
                upvals: frame.upvals,
                ret,
            },
            token,
            sig,
        ))
    }

    fn parse_if(&mut self, ctx: &mut Context, token: Token) -> Option<AstNode> {
        let mut is_let = false;
        let mut let_name = None;
        let mut bound_ty: *mut TypeObj = std::ptr::null_mut();

        if self.tokenizer.peek().kind == TokenKind::Let {
            self.tokenizer.emit();
            let name_token = self.tokenizer.emit();
            if name_token.kind != TokenKind::Identifier {
                return self.error(ctx, "expected name after 'if let'", &name_token);
            }
            if let Err(e) = self.tokenizer.expect(TokenKind::Assign) {
                return self.error(ctx, &e, &name_token);
            }
            is_let = true;
            let_name = Some(self.token_text(&name_token));
        }

        let condition = self.pratt_parse(ctx, 0)?;

        if is_let {
            if !types::is_optional(ctx, condition.ty) {
                return self.error(
                    ctx,
                    "'if let' requires a nullable expression",
                    &condition.source,
                );
            }
            bound_ty = types::remove_nullable(ctx, condition.ty);
        } else if dealias(condition.ty) != dealias(ctx.types.boolean)
            && dealias(condition.ty) != ctx.types.any
        {
            return self.error(ctx, "if condition must be a bool", &condition.source);
        }

        self.push_scope(false);
        if let (true, Some(name)) = (is_let, &let_name) {
            self.push_binding(ParseBinding {
                name: name.clone(),
                ty: bound_ty,
                is_const: false,
                alias: std::ptr::null_mut(),
            });
        }
        let body = self.parse_block(ctx);
        self.pop_scope();
        let body = body?;

        let mut next = None;
        if self.tokenizer.peek().kind == TokenKind::Else {
            self.tokenizer.emit();
            if self.tokenizer.peek().kind == TokenKind::If {
                let else_token = self.tokenizer.emit();
                next = Some(Box::new(self.parse_if(ctx, else_token)?));
            } else {
                self.push_scope(false);
                let else_body = self.parse_block(ctx);
                self.pop_scope();
                next = Some(Box::new(AstNode::new(
                    AstKind::If(IfBranch {
                        condition: None,
                        is_let: false,
                        let_name: None,
                        bound_ty: std::ptr::null_mut(),
                        body: else_body?,
                        next: None,
                    }),
                    token,
                )));
            }
        }

        Some(AstNode::new(
            AstKind::If(IfBranch {
                condition: Some(Box::new(condition)),
                is_let,
                let_name,
                bound_ty,
                body,
                next,
            }),
            token,
        ))
    }

    fn parse_for(&mut self, ctx: &mut Context, token: Token) -> Option<AstNode> {
        let first = self.tokenizer.peek();
        let second = self.tokenizer.peek2();

        // `for cond { … }`: condition loop.
        if !(first.kind == TokenKind::Identifier && second.kind == TokenKind::In) {
            let condition = self.pratt_parse(ctx, 0)?;
            if dealias(condition.ty) != dealias(ctx.types.boolean)
                && dealias(condition.ty) != ctx.types.any
            {
                return self.error(ctx, "loop condition must be a bool", &condition.source);
            }
            self.push_scope(false);
            let body = self.parse_block(ctx);
            self.pop_scope();
            return Some(AstNode::new(
                AstKind::LoopWhile {
                    condition: Box::new(condition),
                    body: body?,
                },
                token,
            ));
        }

        let name_token = self.tokenizer.emit();
        let var_name = self.token_text(&name_token);
        self.tokenizer.emit(); // `in`

        let first_expr = self.pratt_parse(ctx, 0)?;

        // Numeric: `for x in n`, `for x in a to b [by s]`.
        if dealias(first_expr.ty) == dealias(ctx.types.number) {
            let number = ctx.types.number;
            let (start, stop) = if self.tokenizer.peek().kind == TokenKind::To {
                self.tokenizer.emit();
                let stop = self.pratt_parse(ctx, 0)?;
                if dealias(stop.ty) != dealias(number) {
                    return self.error(ctx, "loop bound must be a number", &stop.source);
                }
                (first_expr, stop)
            } else {
                let zero = AstNode::typed(AstKind::EnumLiteral {
                    value: Value::number(0.0),
                }, name_token, number);
                (zero, first_expr)
            };

            let step = if self.tokenizer.peek().kind == TokenKind::By {
                self.tokenizer.emit();
                let step = self.pratt_parse(ctx, 0)?;
                if dealias(step.ty) != dealias(number) {
                    return self.error(ctx, "loop step must be a number", &step.source);
                }
                Some(Box::new(step))
            } else {
                None
            };

            self.push_scope(false);
            self.push_binding(ParseBinding {
                name: var_name.clone(),
                ty: number,
                is_const: false,
                alias: std::ptr::null_mut(),
            });
            let body = self.parse_block(ctx);
            self.pop_scope();

            return Some(AstNode::new(
                AstKind::LoopNumeric {
                    var_name,
                    start: Box::new(start),
                    stop: Box::new(stop),
                    step,
                    body: body?,
                },
                token,
            ));
        }

        // Iterator: the expression must be a generator returning T?.
        let iter_ty = dealias(first_expr.ty);
        let ret = types::signature_return(iter_ty);
        if ret.is_null() || !types::is_optional(ctx, ret) {
            return self.error(
                ctx,
                "for-in iterator must be a fn returning a nullable value",
                &first_expr.source,
            );
        }
        let var_ty = types::remove_nullable(ctx, ret);

        self.push_scope(false);
        self.push_binding(ParseBinding {
            name: var_name.clone(),
            ty: var_ty,
            is_const: false,
            alias: std::ptr::null_mut(),
        });
        let body = self.parse_block(ctx);
        self.pop_scope();

        Some(AstNode::new(
            AstKind::LoopIterator {
                var_name,
                var_ty,
                iterator: Box::new(first_expr),
                body: body?,
            },
            token,
        ))
    }

    // -----------------------------------------------------------------------
    // Types
    // -----------------------------------------------------------------------

    fn resolve_type_identifier(&mut self, ctx: &mut Context, token: &Token) -> Option<*mut TypeObj> {
        let name = self.token_text(token);

        // A local alias binding shadows everything.
        for scope in self.scopes.iter().rev() {
            if let Some(binding) = scope.bindings.iter().rev().find(|b| b.name == name) {
                if binding.ty == ctx.types.type_ && !binding.alias.is_null() {
                    return Some(binding.alias);
                }
            }
        }

        // An imported type.
        for import in &self.imports {
            unsafe {
                if (*(**import).name).as_str() == name
                    && (*dealias((**import).ty)).category == TypeCategory::Type
                {
                    let value = (**import).value;
                    if value.is_object() {
                        return Some(value.as_object() as *mut TypeObj);
                    }
                }
            }
        }

        // The context registry (also reachable through the prelude).
        ctx.find_type(&name)
    }

    /// Parse a type expression: primitives/aliases by name, `[T]`, table
    /// shapes with `final`/`unsealed` prefixes, `{ [K]: V }` maps,
    /// `fn(args): ret` signatures, `enum { … }`, plus `?`, `|`, and `+`
    /// suffixes.
    fn parse_type(&mut self, ctx: &mut Context) -> Option<*mut TypeObj> {
        let token = self.tokenizer.emit();
        let mut result: *mut TypeObj = match token.kind {
            TokenKind::NullLit => ctx.types.null,

            TokenKind::Identifier => match self.resolve_type_identifier(ctx, &token) {
                Some(ty) => ty,
                None => {
                    let text = self.token_text(&token);
                    return self.error_ty(ctx, &format!("unknown type '{}'", text), &token);
                }
            },

            TokenKind::LeftBracket => {
                let inner = self.parse_type(ctx)?;
                if let Err(e) = self.tokenizer.expect(TokenKind::RightBracket) {
                    return self.error_ty(ctx, &e, &token);
                }
                types::make_array_type(ctx, inner)
            }

            TokenKind::Final | TokenKind::Unsealed => {
                let is_final = token.kind == TokenKind::Final;
                let mut unsealed = token.kind == TokenKind::Unsealed;
                let mut next = self.tokenizer.peek();
                if next.kind == TokenKind::Final || next.kind == TokenKind::Unsealed {
                    self.tokenizer.emit();
                    unsealed = unsealed || next.kind == TokenKind::Unsealed;
                    next = self.tokenizer.peek();
                }
                if next.kind != TokenKind::LeftBrace {
                    return self.error_ty(ctx, "expected '{' after table shape modifier", &next);
                }
                let shape = self.parse_tableshape(ctx)?;
                types::tableshape_set_sealed(shape, !unsealed);
                if is_final || token.kind == TokenKind::Final {
                    types::tableshape_set_final(shape, true);
                }
                shape
            }

            TokenKind::LeftBrace => {
                // Push back: parse_tableshape expects the brace.
                self.parse_tableshape_from_brace(ctx, token)?
            }

            TokenKind::Fn => {
                let mut args = Vec::new();
                if self.tokenizer.peek().kind == TokenKind::LeftParen {
                    self.tokenizer.emit();
                    loop {
                        let t = self.tokenizer.peek();
                        if t.kind == TokenKind::RightParen {
                            self.tokenizer.emit();
                            break;
                        }
                        args.push(self.parse_type(ctx)?);
                        if self.tokenizer.peek().kind == TokenKind::Comma {
                            self.tokenizer.emit();
                        }
                    }
                }
                let ret = if self.tokenizer.peek().kind == TokenKind::Colon {
                    self.tokenizer.emit();
                    self.parse_type(ctx)?
                } else {
                    std::ptr::null_mut()
                };
                types::make_signature(ctx, ret, &args)
            }

            TokenKind::Enum => {
                if let Err(e) = self.tokenizer.expect(TokenKind::LeftBrace) {
                    return self.error_ty(ctx, &e, &token);
                }
                let enum_ty = types::make_enum(ctx, "enum");
                let mut ordinal = 0u32;
                loop {
                    let t = self.tokenizer.emit();
                    match t.kind {
                        TokenKind::RightBrace => break,
                        TokenKind::Identifier => {
                            let name = self.token_text(&t);
                            types::enum_push_option(ctx, enum_ty, &name, Value::enum_val(ordinal));
                            ordinal += 1;
                            if self.tokenizer.peek().kind == TokenKind::Comma {
                                self.tokenizer.emit();
                            }
                        }
                        _ => {
                            return self.error_ty(ctx, "expected enum option name", &t);
                        }
                    }
                }
                enum_ty
            }

            _ => {
                return self.error_ty(ctx, "expected a type", &token);
            }
        };

        // Suffixes: `?`, `|`, `+`.
        loop {
            let next = self.tokenizer.peek();
            match next.kind {
                TokenKind::Question => {
                    self.tokenizer.emit();
                    result = types::make_nullable(ctx, result);
                }
                TokenKind::Union => {
                    self.tokenizer.emit();
                    let rhs = self.parse_type(ctx)?;
                    result = types::make_or_extend_union(ctx, result, rhs);
                }
                TokenKind::Plus => {
                    self.tokenizer.emit();
                    let rhs = self.parse_type(ctx)?;
                    result = self.compose_shapes(ctx, result, rhs, &next)?;
                }
                _ => break,
            }
        }

        Some(result)
    }

    fn parse_tableshape(&mut self, ctx: &mut Context) -> Option<*mut TypeObj> {
        let brace = self.tokenizer.emit();
        self.parse_tableshape_from_brace(ctx, brace)
    }

    /// Body of `{ key: T, … }` or `{ [K]: V }`; the opening brace has been
    /// consumed.
    fn parse_tableshape_from_brace(
        &mut self,
        ctx: &mut Context,
        brace: Token,
    ) -> Option<*mut TypeObj> {
        if self.tokenizer.peek().kind == TokenKind::LeftBracket {
            self.tokenizer.emit();
            let key_ty = self.parse_type(ctx)?;
            if let Err(e) = self.tokenizer.expect(TokenKind::RightBracket) {
                return self.error_ty(ctx, &e, &brace);
            }
            if let Err(e) = self.tokenizer.expect(TokenKind::Colon) {
                return self.error_ty(ctx, &e, &brace);
            }
            let value_ty = self.parse_type(ctx)?;
            if let Err(e) = self.tokenizer.expect(TokenKind::RightBrace) {
                return self.error_ty(ctx, &e, &brace);
            }
            return Some(types::make_map(ctx, key_ty, value_ty));
        }

        let shape = types::make_tableshape(ctx, "", true);
        loop {
            let t = self.tokenizer.emit();
            match t.kind {
                TokenKind::RightBrace => break,
                TokenKind::Identifier => {
                    let name = self.token_text(&t);
                    if let Err(e) = self.tokenizer.expect(TokenKind::Colon) {
                        return self.error_ty(ctx, &e, &t);
                    }
                    let field_ty = self.parse_type(ctx)?;
                    let key = make_string_hashed(ctx, &name);
                    types::tableshape_add_layout(ctx, shape, Value::object(key as *mut Obj), field_ty);
                    if self.tokenizer.peek().kind == TokenKind::Comma {
                        self.tokenizer.emit();
                    }
                }
                _ => {
                    return self.error_ty(ctx, "expected field name or '}'", &t);
                }
            }
        }

        Some(shape)
    }

    /// `A + B` at the type level: a fresh shape with both layouts.
    /// Overlapping keys are a parse error.
    fn compose_shapes(
        &mut self,
        ctx: &mut Context,
        a: *mut TypeObj,
        b: *mut TypeObj,
        token: &Token,
    ) -> Option<*mut TypeObj> {
        let a = dealias(a);
        let b = dealias(b);
        unsafe {
            let (TypeData::Tableshape { layout: la, .. }, TypeData::Tableshape { layout: lb, .. }) =
                (&(*a).data, &(*b).data)
            else {
                self.error(ctx, "'+' composes table types", token);
                return None;
            };
            let (la, lb) = (*la, *lb);

            let composed = types::make_tableshape(ctx, "", true);
            if !la.is_null() {
                for pair in (*la).pairs.pairs() {
                    types::tableshape_add_layout(
                        ctx,
                        composed,
                        pair.key,
                        pair.value.as_object() as *mut TypeObj,
                    );
                }
            }
            if !lb.is_null() {
                let pairs: Vec<_> = (*lb).pairs.pairs().to_vec();
                for pair in pairs {
                    if !la.is_null() && !table_get(la, pair.key).is_null() {
                        let key = crate::object::to_string(ctx, pair.key);
                        let message = format!(
                            "cannot compose types: duplicate key '{}'",
                            (*key).as_str()
                        );
                        self.error(ctx, &message, token);
                        return None;
                    }
                    types::tableshape_add_layout(
                        ctx,
                        composed,
                        pair.key,
                        pair.value.as_object() as *mut TypeObj,
                    );
                }
            }
            types::tableshape_set_parent(composed, a);
            Some(composed)
        }
    }

    // -----------------------------------------------------------------------
    // Expressions
    // -----------------------------------------------------------------------

    fn parse_expression_expecting(
        &mut self,
        ctx: &mut Context,
        expected: *mut TypeObj,
    ) -> Option<AstNode> {
        // Table literals pick up the expected shape so construction can
        // attach the prototype directly.
        if !expected.is_null()
            && self.tokenizer.peek().kind == TokenKind::LeftBrace
            && unsafe { (*dealias(expected)).category == TypeCategory::Tableshape }
        {
            let brace = self.tokenizer.emit();
            return self.parse_table_literal(ctx, brace, dealias(expected));
        }
        self.pratt_parse(ctx, 0)
    }

    pub(crate) fn pratt_parse(&mut self, ctx: &mut Context, min_bp: u32) -> Option<AstNode> {
        let token = self.tokenizer.emit();

        let mut lhs = match token.kind {
            TokenKind::NumberLit
            | TokenKind::StringLit
            | TokenKind::TrueLit
            | TokenKind::FalseLit
            | TokenKind::NullLit => {
                let ty = match token.kind {
                    TokenKind::NumberLit => ctx.types.number,
                    TokenKind::StringLit => ctx.types.string,
                    TokenKind::NullLit => ctx.types.null,
                    _ => ctx.types.boolean,
                };
                AstNode::typed(AstKind::Literal, token, ty)
            }

            TokenKind::Identifier => self.identifier_node(ctx, token)?,

            TokenKind::LeftParen => {
                let inner = self.pratt_parse(ctx, 0)?;
                if let Err(e) = self.tokenizer.expect(TokenKind::RightParen) {
                    return self.error(ctx, &e, &token);
                }
                inner
            }

            TokenKind::LeftBracket => self.parse_array_literal(ctx, token)?,
            TokenKind::LeftBrace => self.parse_table_literal(ctx, token, std::ptr::null_mut())?,
            TokenKind::Fn => self.parse_function_literal(ctx, token, None)?,

            TokenKind::Typeof => {
                let operand = self.pratt_parse(ctx, prefix_binding_power(TokenKind::Not))?;
                AstNode::typed(
                    AstKind::TypeLiteral { ty: operand.ty },
                    token,
                    ctx.types.type_,
                )
            }

            TokenKind::Plus | TokenKind::Minus | TokenKind::Not => {
                let bp = prefix_binding_power(token.kind);
                let operand = self.pratt_parse(ctx, bp)?;
                self.unary_node(ctx, token, operand)?
            }

            _ => {
                return self.error(
                    ctx,
                    &format!("unexpected '{}' in expression", token.kind.describe()),
                    &token,
                );
            }
        };

        loop {
            let op = self.tokenizer.peek();

            let post_bp = postfix_binding_power(op.kind);
            if post_bp != 0 {
                if post_bp < min_bp {
                    break;
                }
                self.tokenizer.emit();
                lhs = self.postfix_node(ctx, op, lhs)?;
                continue;
            }

            let (left_bp, right_bp) = infix_binding_power(op.kind);
            if left_bp != 0 {
                if left_bp < min_bp {
                    break;
                }
                self.tokenizer.emit();

                // `is` / `as` / `satisfies` take a type on the right.
                if matches!(op.kind, TokenKind::Is | TokenKind::As | TokenKind::Satisfies) {
                    let ty = self.parse_type(ctx)?;
                    let rhs = AstNode::typed(AstKind::TypeLiteral { ty }, op, ctx.types.type_);
                    lhs = self.binary_node(ctx, op, lhs, rhs)?;
                } else {
                    let rhs = self.pratt_parse(ctx, right_bp)?;
                    lhs = self.binary_node(ctx, op, lhs, rhs)?;
                }
                continue;
            }

            break;
        }

        Some(lhs)
    }

    fn identifier_node(&mut self, ctx: &mut Context, token: Token) -> Option<AstNode> {
        let name = self.token_text(&token);
        match self.resolve(ctx, &name) {
            Resolution::Local(binding) | Resolution::Upvalue(binding) => {
                // Type aliases have no runtime register; they load as
                // constants.
                if !binding.alias.is_null() {
                    return Some(AstNode::typed(
                        AstKind::TypeLiteral { ty: binding.alias },
                        token,
                        ctx.types.type_,
                    ));
                }
                Some(AstNode::typed(AstKind::Identifier, token, binding.ty))
            }
            Resolution::Import(index, ty) => Some(AstNode::typed(
                AstKind::ImportRef { index },
                token,
                ty,
            )),
            Resolution::Unknown => {
                self.error(ctx, &format!("unknown identifier '{}'", name), &token)
            }
        }
    }

    fn parse_array_literal(&mut self, ctx: &mut Context, token: Token) -> Option<AstNode> {
        let mut items = Vec::new();
        let mut inner: *mut TypeObj = std::ptr::null_mut();

        loop {
            let t = self.tokenizer.peek();
            if t.kind == TokenKind::RightBracket {
                self.tokenizer.emit();
                break;
            }
            let item = self.pratt_parse(ctx, 0)?;
            inner = if inner.is_null() {
                item.ty
            } else if types::type_is_equal(inner, item.ty) {
                inner
            } else {
                types::make_or_extend_union(ctx, inner, item.ty)
            };
            items.push(item);
            if self.tokenizer.peek().kind == TokenKind::Comma {
                self.tokenizer.emit();
            }
        }

        if inner.is_null() {
            inner = ctx.types.any;
        }
        let ty = types::make_array_type(ctx, inner);
        Some(AstNode::typed(AstKind::Array { items }, token, ty))
    }

    /// `{ key: expr, … }`. When `shape` is non-null the literal is checked
    /// against it and constructed with its prototype attached.
    fn parse_table_literal(
        &mut self,
        ctx: &mut Context,
        token: Token,
        shape: *mut TypeObj,
    ) -> Option<AstNode> {
        let mut fields = Vec::new();
        let inferred = if shape.is_null() {
            types::make_tableshape(ctx, "", false)
        } else {
            shape
        };

        loop {
            let t = self.tokenizer.emit();
            match t.kind {
                TokenKind::RightBrace => break,
                TokenKind::Identifier | TokenKind::StringLit => {
                    let key = match t.kind {
                        TokenKind::Identifier => {
                            let name = self.token_text(&t);
                            make_string_hashed(ctx, &name)
                        }
                        _ => match self.tokenizer.literal(&t) {
                            Literal::Str(s) => {
                                let s = s.clone();
                                make_string_hashed(ctx, &s)
                            }
                            _ => unreachable!(),
                        },
                    };
                    let key = Value::object(key as *mut Obj);

                    if fields.iter().any(|f: &TableField| value_is_equal(f.key, key)) {
                        return self.error(ctx, "duplicate key in table literal", &t);
                    }

                    if let Err(e) = self.tokenizer.expect(TokenKind::Colon) {
                        return self.error(ctx, &e, &t);
                    }
                    let expr = self.pratt_parse(ctx, 0)?;

                    if shape.is_null() {
                        types::tableshape_add_layout(ctx, inferred, key, expr.ty);
                    } else {
                        let declared = types::tableshape_get_layout(shape, key);
                        if declared.is_null() {
                            return self.error(ctx, "key not present in table type", &t);
                        }
                        if !type_satisfies(declared, expr.ty) {
                            return self.error(
                                ctx,
                                &format!(
                                    "field of type '{}' does not satisfy '{}'",
                                    type_name(expr.ty),
                                    type_name(declared)
                                ),
                                &t,
                            );
                        }
                    }

                    fields.push(TableField {
                        key,
                        value_ty: expr.ty,
                        expr,
                    });

                    if self.tokenizer.peek().kind == TokenKind::Comma {
                        self.tokenizer.emit();
                    }
                }
                _ => {
                    return self.error(ctx, "expected key or '}' in table literal", &t);
                }
            }
        }

        // A declared shape requires every non-optional field.
        if !shape.is_null() {
            unsafe {
                if let TypeData::Tableshape { layout, .. } = &(*dealias(shape)).data {
                    let layout = *layout;
                    if !layout.is_null() {
                        let pairs: Vec<_> = (*layout).pairs.pairs().to_vec();
                        for pair in pairs {
                            let present =
                                fields.iter().any(|f: &TableField| value_is_equal(f.key, pair.key));
                            let field_ty = pair.value.as_object() as *mut TypeObj;
                            if !present && !types::is_optional(ctx, field_ty) {
                                let name = crate::object::to_string(ctx, pair.key);
                                return self.error(
                                    ctx,
                                    &format!("missing field '{}' in table literal", (*name).as_str()),
                                    &token,
                                );
                            }
                        }
                    }
                }
            }
        }

        Some(AstNode::typed(
            AstKind::Table {
                fields,
                shape: if shape.is_null() {
                    std::ptr::null_mut()
                } else {
                    shape
                },
            },
            token,
            inferred,
        ))
    }

    fn unary_node(&mut self, ctx: &mut Context, token: Token, operand: AstNode) -> Option<AstNode> {
        let (ty, accelerated) = match token.kind {
            TokenKind::Minus => {
                let accelerated = dealias(operand.ty) == dealias(ctx.types.number);
                if !accelerated && dealias(operand.ty) != ctx.types.any {
                    return self.error(ctx, "cannot negate a non-number", &token);
                }
                (operand.ty, accelerated)
            }
            TokenKind::Plus => (operand.ty, false),
            TokenKind::Not => {
                if dealias(operand.ty) != dealias(ctx.types.boolean) {
                    return self.error(ctx, "'not' requires a bool", &token);
                }
                (ctx.types.boolean, false)
            }
            _ => unreachable!(),
        };

        Some(AstNode::typed(
            AstKind::UnaryOp {
                operand: Box::new(operand),
                accelerated,
            },
            token,
            ty,
        ))
    }

    fn postfix_node(&mut self, ctx: &mut Context, op: Token, lhs: AstNode) -> Option<AstNode> {
        match op.kind {
            // `expr!` unwraps a nullable, trapping on null.
            TokenKind::Bang => {
                if !types::is_optional(ctx, lhs.ty) {
                    return self.error(ctx, "'!' requires a nullable value", &op);
                }
                let ty = types::remove_nullable(ctx, lhs.ty);
                Some(AstNode::typed(
                    AstKind::UnaryOp {
                        operand: Box::new(lhs),
                        accelerated: false,
                    },
                    op,
                    ty,
                ))
            }

            // `expr?` tests for null.
            TokenKind::Question => {
                if !types::is_optional(ctx, lhs.ty) {
                    return self.error(ctx, "'?' requires a nullable value", &op);
                }
                Some(AstNode::typed(
                    AstKind::UnaryOp {
                        operand: Box::new(lhs),
                        accelerated: false,
                    },
                    op,
                    ctx.types.boolean,
                ))
            }

            TokenKind::LeftBracket => {
                let index = self.pratt_parse(ctx, 0)?;
                if let Err(e) = self.tokenizer.expect(TokenKind::RightBracket) {
                    return self.error(ctx, &e, &op);
                }
                self.index_node(ctx, op, lhs, index)
            }

            TokenKind::LeftParen => self.call_node(ctx, op, lhs),

            TokenKind::FatArrow => self.error(ctx, "unexpected '=>'", &op),

            _ => unreachable!(),
        }
    }

    fn index_node(
        &mut self,
        ctx: &mut Context,
        op: Token,
        lhs: AstNode,
        index: AstNode,
    ) -> Option<AstNode> {
        let lhs_ty = dealias(lhs.ty);
        unsafe {
            match (*lhs_ty).category {
                TypeCategory::Array => {
                    let inner = types::array_inner(lhs_ty);
                    let accelerated = dealias(index.ty) == dealias(ctx.types.number);
                    if !accelerated && dealias(index.ty) != ctx.types.any {
                        return self.error(ctx, "array index must be a number", &op);
                    }
                    Some(AstNode::typed(
                        AstKind::BinaryOp {
                            left: Box::new(lhs),
                            right: Box::new(index),
                            accelerated,
                            hoistable: false,
                            from: std::ptr::null_mut(),
                            key: VALUE_NULL,
                            idx: 0,
                        },
                        op,
                        inner,
                    ))
                }
                TypeCategory::Tableshape => {
                    if let TypeData::Tableshape {
                        map: true,
                        key_type,
                        value_type,
                        ..
                    } = &(*lhs_ty).data
                    {
                        let (key_type, value_type) = (*key_type, *value_type);
                        if !type_satisfies(key_type, index.ty) {
                            return self.error(ctx, "map key type mismatch", &op);
                        }
                        let value_ty = types::make_nullable(ctx, value_type);
                        return Some(AstNode::typed(
                            AstKind::BinaryOp {
                                left: Box::new(lhs),
                                right: Box::new(index),
                                accelerated: false,
                                hoistable: false,
                                from: std::ptr::null_mut(),
                                key: VALUE_NULL,
                                idx: 0,
                            },
                            op,
                            value_ty,
                        ));
                    }
                    let any = ctx.types.any;
                    Some(AstNode::typed(
                        AstKind::BinaryOp {
                            left: Box::new(lhs),
                            right: Box::new(index),
                            accelerated: false,
                            hoistable: false,
                            from: std::ptr::null_mut(),
                            key: VALUE_NULL,
                            idx: 0,
                        },
                        op,
                        any,
                    ))
                }
                _ => {
                    let any = ctx.types.any;
                    if lhs_ty != any {
                        return self.error(ctx, "value is not indexable", &op);
                    }
                    Some(AstNode::typed(
                        AstKind::BinaryOp {
                            left: Box::new(lhs),
                            right: Box::new(index),
                            accelerated: false,
                            hoistable: false,
                            from: std::ptr::null_mut(),
                            key: VALUE_NULL,
                            idx: 0,
                        },
                        op,
                        any,
                    ))
                }
            }
        }
    }

    fn call_node(&mut self, ctx: &mut Context, op: Token, callee: AstNode) -> Option<AstNode> {
        if callee.ty.is_null() {
            return self.error(ctx, "value is not callable", &op);
        }

        let mut args = Vec::new();
        loop {
            let t = self.tokenizer.peek();
            if t.kind == TokenKind::RightParen {
                self.tokenizer.emit();
                break;
            }
            args.push(self.pratt_parse(ctx, 0)?);
            if self.tokenizer.peek().kind == TokenKind::Comma {
                self.tokenizer.emit();
            }
        }

        let callee_ty = dealias(callee.ty);

        // Method sugar: `obj.member(args)` prepends obj when the member is a
        // method whose first parameter accepts it.
        let mut is_methodcall = false;
        if let AstKind::BinaryOp { left, .. } = &callee.kind {
            if callee.source.kind == TokenKind::Period && types::signature_is_method(callee_ty) {
                let receiver_ty = left.ty;
                is_methodcall = self.method_first_arg_accepts(ctx, callee_ty, receiver_ty, &args);
            }
        }

        unsafe {
            let resolved = if (*callee_ty).is_polymorphic {
                let mut arg_tys: Vec<*mut TypeObj> = Vec::new();
                if is_methodcall {
                    if let AstKind::BinaryOp { left, .. } = &callee.kind {
                        arg_tys.push(left.ty);
                    }
                }
                arg_tys.extend(args.iter().map(|a| a.ty));

                match types::apply_poly(ctx, callee_ty, &arg_tys) {
                    Some(sig) => sig,
                    None if is_methodcall => {
                        // Retry without the implicit receiver.
                        let plain: Vec<*mut TypeObj> = args.iter().map(|a| a.ty).collect();
                        match types::apply_poly(ctx, callee_ty, &plain) {
                            Some(sig) => {
                                is_methodcall = false;
                                sig
                            }
                            None => {
                                return self.error(
                                    ctx,
                                    "no matching signature for polymorphic call",
                                    &op,
                                );
                            }
                        }
                    }
                    None => {
                        return self.error(ctx, "no matching signature for polymorphic call", &op);
                    }
                }
            } else {
                callee_ty
            };

            let TypeData::Signature {
                args: declared,
                ret,
                is_vararg,
                varargs,
                ..
            } = &(*dealias(resolved)).data
            else {
                if callee_ty == ctx.types.any {
                    // Calls through `any` defer all checking to runtime.
                    let any = ctx.types.any;
                    return Some(AstNode::typed(
                        AstKind::Call {
                            callee: Box::new(callee),
                            args,
                            is_methodcall,
                            sig: std::ptr::null_mut(),
                        },
                        op,
                        any,
                    ));
                }
                return self.error(ctx, "value is not callable", &op);
            };

            let effective_argc = args.len() + is_methodcall as usize;
            if effective_argc != declared.len() {
                if !(*is_vararg && effective_argc > declared.len()) {
                    return self.error(
                        ctx,
                        &format!(
                            "call expects {} argument(s), got {}",
                            declared.len(),
                            effective_argc
                        ),
                        &op,
                    );
                }
            }

            let skip = is_methodcall as usize;
            for (i, arg) in args.iter().enumerate() {
                let slot = i + skip;
                let declared_ty = if slot < declared.len() {
                    declared[slot]
                } else {
                    *varargs
                };
                if !declared_ty.is_null() && !type_satisfies(declared_ty, arg.ty) {
                    return self.error(
                        ctx,
                        &format!(
                            "argument {} of type '{}' does not satisfy '{}'",
                            i + 1,
                            type_name(arg.ty),
                            type_name(declared_ty)
                        ),
                        &arg.source,
                    );
                }
            }

            let ret = *ret;
            Some(AstNode::typed(
                AstKind::Call {
                    callee: Box::new(callee),
                    args,
                    is_methodcall,
                    sig: resolved,
                },
                op,
                ret,
            ))
        }
    }

    fn method_first_arg_accepts(
        &self,
        _ctx: &mut Context,
        sig: *mut TypeObj,
        receiver: *mut TypeObj,
        _args: &[AstNode],
    ) -> bool {
        unsafe {
            match &(*dealias(sig)).data {
                TypeData::Signature { args, .. } => args
                    .first()
                    .is_some_and(|first| type_satisfies(*first, receiver)),
                // Polymorphic methods decide through their applicator.
                TypeData::Poly { is_method, .. } => *is_method,
                _ => false,
            }
        }
    }

    fn binary_node(
        &mut self,
        ctx: &mut Context,
        op: Token,
        lhs: AstNode,
        rhs: AstNode,
    ) -> Option<AstNode> {
        let number = ctx.types.number;
        let boolean = ctx.types.boolean;
        let string = ctx.types.string;

        let make = |lhs: AstNode, rhs: AstNode, ty: *mut TypeObj, accelerated: bool| {
            AstNode::typed(
                AstKind::BinaryOp {
                    left: Box::new(lhs),
                    right: Box::new(rhs),
                    accelerated,
                    hoistable: false,
                    from: std::ptr::null_mut(),
                    key: VALUE_NULL,
                    idx: 0,
                },
                op,
                ty,
            )
        };

        match op.kind {
            TokenKind::Assign
            | TokenKind::PlusEq
            | TokenKind::MinusEq
            | TokenKind::MulEq
            | TokenKind::DivEq => {
                self.check_assignable(ctx, &lhs, &op)?;
                if op.kind != TokenKind::Assign {
                    let both_numbers = dealias(lhs.ty) == dealias(number)
                        && dealias(rhs.ty) == dealias(number);
                    let string_append = op.kind == TokenKind::PlusEq
                        && dealias(lhs.ty) == dealias(string)
                        && dealias(rhs.ty) == dealias(string);
                    if !both_numbers && !string_append && dealias(lhs.ty) != ctx.types.any {
                        return self.error(ctx, "compound assignment requires numbers", &op);
                    }
                    let ty = lhs.ty;
                    return Some(make(lhs, rhs, ty, both_numbers));
                }
                if !type_satisfies(lhs.ty, rhs.ty) {
                    return self.error(
                        ctx,
                        &format!(
                            "cannot assign '{}' to '{}'",
                            type_name(rhs.ty),
                            type_name(lhs.ty)
                        ),
                        &op,
                    );
                }
                let ty = lhs.ty;
                Some(make(lhs, rhs, ty, false))
            }

            TokenKind::And | TokenKind::Or => {
                if dealias(lhs.ty) != dealias(boolean) || dealias(rhs.ty) != dealias(boolean) {
                    return self.error(ctx, "'and'/'or' require bools", &op);
                }
                Some(make(lhs, rhs, boolean, false))
            }

            TokenKind::Equals | TokenKind::NotEq => {
                let accelerated =
                    dealias(lhs.ty) == dealias(number) && dealias(rhs.ty) == dealias(number);
                Some(make(lhs, rhs, boolean, accelerated))
            }

            TokenKind::Lt | TokenKind::Lte | TokenKind::Gt | TokenKind::Gte => {
                let accelerated =
                    dealias(lhs.ty) == dealias(number) && dealias(rhs.ty) == dealias(number);
                if !accelerated {
                    let meta = self.comparison_meta(ctx, lhs.ty, op.kind);
                    if meta.is_null() && dealias(lhs.ty) != ctx.types.any {
                        return self.error(ctx, "cannot order non-numbers", &op);
                    }
                }
                Some(make(lhs, rhs, boolean, accelerated))
            }

            TokenKind::NullCoalesce => {
                if !types::is_optional(ctx, lhs.ty) {
                    return self.error(ctx, "'??' requires a nullable left side", &op);
                }
                let stripped = types::remove_nullable(ctx, lhs.ty);
                if !type_satisfies(stripped, rhs.ty) {
                    return self.error(
                        ctx,
                        &format!(
                            "'??' fallback of type '{}' does not satisfy '{}'",
                            type_name(rhs.ty),
                            type_name(stripped)
                        ),
                        &op,
                    );
                }
                Some(make(lhs, rhs, stripped, false))
            }

            TokenKind::Is | TokenKind::Satisfies => Some(make(lhs, rhs, boolean, false)),

            TokenKind::As => {
                let AstKind::TypeLiteral { ty: target } = &rhs.kind else {
                    return self.error(ctx, "'as' requires a type", &op);
                };
                let target = *target;
                // A freshly built literal can be re-prototyped in place, but
                // only when its pair order matches the target layout —
                // accelerated field reads index pairs directly.
                let accelerated = matches!(&lhs.kind, AstKind::Table { .. })
                    && self.literal_matches_layout(&lhs, target);
                let node = make(lhs, rhs, target, accelerated);
                Some(node)
            }

            TokenKind::Plus | TokenKind::Minus | TokenKind::Mul | TokenKind::Div => {
                let both_numbers =
                    dealias(lhs.ty) == dealias(number) && dealias(rhs.ty) == dealias(number);
                if both_numbers {
                    return Some(make(lhs, rhs, number, true));
                }
                if op.kind == TokenKind::Plus
                    && dealias(lhs.ty) == dealias(string)
                    && dealias(rhs.ty) == dealias(string)
                {
                    return Some(make(lhs, rhs, string, false));
                }

                let meta = self.arith_meta(ctx, lhs.ty, op.kind);
                if !meta.is_null() {
                    let ret = types::signature_return(meta);
                    return Some(make(lhs, rhs, ret, false));
                }

                if dealias(lhs.ty) == ctx.types.any || dealias(rhs.ty) == ctx.types.any {
                    let any = ctx.types.any;
                    return Some(make(lhs, rhs, any, false));
                }

                self.error(
                    ctx,
                    &format!(
                        "cannot apply '{}' to '{}' and '{}'",
                        op.kind.describe(),
                        type_name(lhs.ty),
                        type_name(rhs.ty)
                    ),
                    &op,
                )
            }

            TokenKind::Period => self.dot_node(ctx, op, lhs, rhs),

            TokenKind::Compose => {
                let composed = self.compose_shapes(ctx, lhs.ty, rhs.ty, &op)?;
                Some(make(lhs, rhs, composed, false))
            }

            _ => self.error(
                ctx,
                &format!("unsupported operator '{}'", op.kind.describe()),
                &op,
            ),
        }
    }

    /// True when a table literal's fields line up one-to-one, in order,
    /// with the target shape's layout.
    fn literal_matches_layout(&self, lhs: &AstNode, target: *mut TypeObj) -> bool {
        let AstKind::Table { fields, .. } = &lhs.kind else {
            return false;
        };
        unsafe {
            let target = dealias(target);
            if (*target).category != TypeCategory::Tableshape {
                return false;
            }
            let TypeData::Tableshape { layout, .. } = &(*target).data else {
                return false;
            };
            let layout = *layout;
            if layout.is_null() || (*layout).pairs.len() != fields.len() {
                return false;
            }
            for (pair, field) in (*layout).pairs.pairs().iter().zip(fields.iter()) {
                if !value_is_equal(pair.key, field.key) {
                    return false;
                }
            }
        }
        true
    }

    fn check_assignable(&mut self, ctx: &mut Context, lhs: &AstNode, op: &Token) -> Option<()> {
        match &lhs.kind {
            AstKind::Identifier => {
                let name = self.token_text(&lhs.source);
                for scope in self.scopes.iter().rev() {
                    if let Some(binding) = scope.bindings.iter().rev().find(|b| b.name == name) {
                        if binding.is_const {
                            self.error(
                                ctx,
                                &format!("cannot assign to const binding '{}'", name),
                                op,
                            );
                            return None;
                        }
                        return Some(());
                    }
                }
                // Upvalue of an enclosing function; const-ness was checked
                // when the binding resolved.
                Some(())
            }
            AstKind::ImportRef { .. } => {
                self.error(ctx, "imports are not assignable", op);
                None
            }
            AstKind::BinaryOp { .. }
                if matches!(
                    lhs.source.kind,
                    TokenKind::Period | TokenKind::LeftBracket | TokenKind::IdentifierLit
                ) =>
            {
                Some(())
            }
            _ => {
                self.error(ctx, "invalid assignment target", op);
                None
            }
        }
    }

    fn arith_meta(&mut self, ctx: &mut Context, ty: *mut TypeObj, op: TokenKind) -> *mut TypeObj {
        let name = match op {
            TokenKind::Plus | TokenKind::PlusEq => ctx.meta_names.add,
            TokenKind::Minus | TokenKind::MinusEq => ctx.meta_names.sub,
            TokenKind::Mul | TokenKind::MulEq => ctx.meta_names.mul,
            TokenKind::Div | TokenKind::DivEq => ctx.meta_names.div,
            _ => return std::ptr::null_mut(),
        };
        types::type_get_field_type(dealias(ty), Value::object(name as *mut Obj))
    }

    fn comparison_meta(
        &mut self,
        ctx: &mut Context,
        ty: *mut TypeObj,
        op: TokenKind,
    ) -> *mut TypeObj {
        let name = match op {
            TokenKind::Lt | TokenKind::Gt => ctx.meta_names.lt,
            TokenKind::Lte | TokenKind::Gte => ctx.meta_names.lte,
            _ => return std::ptr::null_mut(),
        };
        types::type_get_field_type(dealias(ty), Value::object(name as *mut Obj))
    }

    /// Dot access. The right identifier becomes a string key; the result is
    /// typed from (in order) the type's prototype members, a map shape's
    /// value type, or the tableshape layout — with acceleration and hoisting
    /// flags recorded where the layout is static.
    fn dot_node(
        &mut self,
        ctx: &mut Context,
        op: Token,
        lhs: AstNode,
        mut rhs: AstNode,
    ) -> Option<AstNode> {
        // Demote the member identifier to a literal key.
        let key = match rhs.kind {
            AstKind::Identifier | AstKind::ImportRef { .. } | AstKind::Literal => {
                let name = self.token_text(&rhs.source);
                let key = make_string_hashed(ctx, &name);
                rhs = AstNode::typed(AstKind::Literal, rhs.source, ctx.types.string);
                rhs.source.kind = TokenKind::IdentifierLit;
                Value::object(key as *mut Obj)
            }
            _ => {
                return self.error(ctx, "expected member name after '.'", &op);
            }
        };

        // Enum option access: `Color.Red` is a compile-time constant.
        if lhs.ty == ctx.types.type_ {
            let target = match &lhs.kind {
                AstKind::TypeLiteral { ty } => *ty,
                AstKind::Identifier => {
                    self.resolve_type_identifier(ctx, &lhs.source).unwrap_or(std::ptr::null_mut())
                }
                AstKind::ImportRef { index } => unsafe {
                    let value = (*self.imports[*index as usize]).value;
                    if value.is_object() {
                        value.as_object() as *mut TypeObj
                    } else {
                        std::ptr::null_mut()
                    }
                },
                _ => std::ptr::null_mut(),
            };

            if !target.is_null() {
                let deal = dealias(target);
                unsafe {
                    if (*deal).category == TypeCategory::Enum {
                        let name = self.token_text(&rhs.source);
                        let value = types::enum_get(ctx, deal, &name);
                        if value.is_null() {
                            return self.error(
                                ctx,
                                &format!("enum has no option '{}'", name),
                                &rhs.source,
                            );
                        }
                        return Some(AstNode::typed(
                            AstKind::EnumLiteral { value },
                            op,
                            deal,
                        ));
                    }
                }
                // Static member on a type object.
                let member_ty = types::type_get_field_type(deal, key);
                if !member_ty.is_null() {
                    return Some(AstNode::typed(
                        AstKind::BinaryOp {
                            left: Box::new(lhs),
                            right: Box::new(rhs),
                            accelerated: false,
                            hoistable: false,
                            from: std::ptr::null_mut(),
                            key,
                            idx: 0,
                        },
                        op,
                        member_ty,
                    ));
                }
            }
            return self.error(ctx, "unknown member on type", &op);
        }

        let lhs_ty = dealias(lhs.ty);

        // The untyped `table` primitive defers everything to runtime.
        if lhs_ty == dealias(ctx.types.table) {
            let any = ctx.types.any;
            return Some(AstNode::typed(
                AstKind::BinaryOp {
                    left: Box::new(lhs),
                    right: Box::new(rhs),
                    accelerated: false,
                    hoistable: false,
                    from: std::ptr::null_mut(),
                    key,
                    idx: 0,
                },
                op,
                any,
            ));
        }

        // Prototype members (methods, metamethods) come first.
        let member_ty = types::type_get_field_type(lhs_ty, key);
        if !member_ty.is_null() {
            let hoistable = types::tableshape_is_final(lhs_ty);
            return Some(AstNode::typed(
                AstKind::BinaryOp {
                    left: Box::new(lhs),
                    right: Box::new(rhs),
                    accelerated: false,
                    hoistable,
                    from: if hoistable { lhs_ty } else { std::ptr::null_mut() },
                    key,
                    idx: 0,
                },
                op,
                member_ty,
            ));
        }

        unsafe {
            match (*lhs_ty).category {
                TypeCategory::Tableshape => {
                    if let TypeData::Tableshape {
                        map: true,
                        key_type,
                        value_type,
                        ..
                    } = &(*lhs_ty).data
                    {
                        let (key_type, value_type) = (*key_type, *value_type);
                        if !type_satisfies(key_type, ctx.types.string) {
                            return self.error(ctx, "map key type mismatch", &op);
                        }
                        let value_ty = types::make_nullable(ctx, value_type);
                        return Some(AstNode::typed(
                            AstKind::BinaryOp {
                                left: Box::new(lhs),
                                right: Box::new(rhs),
                                accelerated: false,
                                hoistable: false,
                                from: std::ptr::null_mut(),
                                key,
                                idx: 0,
                            },
                            op,
                            value_ty,
                        ));
                    }

                    if let TypeData::Tableshape { layout, sealed, .. } = &(*lhs_ty).data {
                        let (layout, sealed) = (*layout, *sealed);
                        if !layout.is_null() {
                            let idx = crate::object::table_get_idx(layout, key);
                            if idx >= 0 {
                                let field_ty = table_get(layout, key).as_object() as *mut TypeObj;
                                // A sealed layout pins field order, making a
                                // direct pair index safe.
                                let accelerated = sealed && idx <= u8::MAX as i32;
                                return Some(AstNode::typed(
                                    AstKind::BinaryOp {
                                        left: Box::new(lhs),
                                        right: Box::new(rhs),
                                        accelerated,
                                        hoistable: false,
                                        from: std::ptr::null_mut(),
                                        key,
                                        idx: idx as u8,
                                    },
                                    op,
                                    field_ty,
                                ));
                            }
                        }
                    }

                    let name = self.token_text(&rhs.source);
                    self.error(
                        ctx,
                        &format!("no field '{}' on '{}'", name, type_name(lhs_ty)),
                        &op,
                    )
                }

                TypeCategory::Userdata => {
                    let field_ty = types::userdata_field_type(lhs_ty, key);
                    if field_ty.is_null() {
                        let name = self.token_text(&rhs.source);
                        return self.error(
                            ctx,
                            &format!("no field '{}' on '{}'", name, type_name(lhs_ty)),
                            &op,
                        );
                    }
                    Some(AstNode::typed(
                        AstKind::BinaryOp {
                            left: Box::new(lhs),
                            right: Box::new(rhs),
                            accelerated: false,
                            hoistable: false,
                            from: std::ptr::null_mut(),
                            key,
                            idx: 0,
                        },
                        op,
                        field_ty,
                    ))
                }

                // Arrays and strings expose their built-in methods through
                // the primitive type's prototype.
                TypeCategory::Array => {
                    let member = types::type_get_field_type(ctx.types.array, key);
                    if member.is_null() {
                        let name = self.token_text(&rhs.source);
                        return self.error(
                            ctx,
                            &format!("no method '{}' on arrays", name),
                            &op,
                        );
                    }
                    Some(AstNode::typed(
                        AstKind::BinaryOp {
                            left: Box::new(lhs),
                            right: Box::new(rhs),
                            accelerated: false,
                            hoistable: false,
                            from: std::ptr::null_mut(),
                            key,
                            idx: 0,
                        },
                        op,
                        member,
                    ))
                }

                TypeCategory::Primitive if lhs_ty == dealias(ctx.types.string) => {
                    let member = types::type_get_field_type(ctx.types.string, key);
                    if member.is_null() {
                        let name = self.token_text(&rhs.source);
                        return self.error(
                            ctx,
                            &format!("no method '{}' on strings", name),
                            &op,
                        );
                    }
                    Some(AstNode::typed(
                        AstKind::BinaryOp {
                            left: Box::new(lhs),
                            right: Box::new(rhs),
                            accelerated: false,
                            hoistable: false,
                            from: std::ptr::null_mut(),
                            key,
                            idx: 0,
                        },
                        op,
                        member,
                    ))
                }

                _ if lhs_ty == ctx.types.any => {
                    let any = ctx.types.any;
                    Some(AstNode::typed(
                        AstKind::BinaryOp {
                            left: Box::new(lhs),
                            right: Box::new(rhs),
                            accelerated: false,
                            hoistable: false,
                            from: std::ptr::null_mut(),
                            key,
                            idx: 0,
                        },
                        op,
                        any,
                    ))
                }

                // Module access through an import.
                _ => {
                    let name = self.token_text(&rhs.source);
                    self.error(
                        ctx,
                        &format!("cannot access '{}' on '{}'", name, type_name(lhs_ty)),
                        &op,
                    )
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Binding powers (spec table)
// ---------------------------------------------------------------------------

fn prefix_binding_power(kind: TokenKind) -> u32 {
    match kind {
        TokenKind::Plus | TokenKind::Minus => 13,
        TokenKind::Not => 14,
        _ => 0,
    }
}

fn postfix_binding_power(kind: TokenKind) -> u32 {
    match kind {
        TokenKind::Bang => 10,
        TokenKind::Question => 15,
        TokenKind::LeftBracket => 17,
        TokenKind::FatArrow => 18,
        TokenKind::LeftParen => 19,
        _ => 0,
    }
}

fn infix_binding_power(kind: TokenKind) -> (u32, u32) {
    match kind {
        TokenKind::Assign => (2, 1),
        TokenKind::PlusEq | TokenKind::MinusEq | TokenKind::MulEq | TokenKind::DivEq => (4, 3),
        TokenKind::And | TokenKind::Or => (5, 6),
        TokenKind::Equals | TokenKind::NotEq => (7, 8),
        TokenKind::Lt | TokenKind::Lte | TokenKind::Gt | TokenKind::Gte => (9, 10),
        TokenKind::NullCoalesce => (11, 12),
        TokenKind::Is | TokenKind::As | TokenKind::Satisfies => (13, 14),
        TokenKind::Plus | TokenKind::Minus => (15, 16),
        TokenKind::Mul | TokenKind::Div => (17, 18),
        TokenKind::Period => (19, 20),
        TokenKind::Compose => (21, 22),
        _ => (0, 0),
    }
}

/// Infer a function's return type by unioning the types of every `return`
/// in its body, descending into conditional branches and loops. Null when
/// the body never returns a value.
fn infer_return(ctx: &mut Context, body: &[AstNode]) -> *mut TypeObj {
    fn walk(ctx: &mut Context, stmts: &[AstNode], acc: &mut Vec<*mut TypeObj>) {
        for stmt in stmts {
            match &stmt.kind {
                AstKind::Return { expr } => {
                    if let Some(expr) = expr {
                        acc.push(expr.ty);
                    }
                }
                AstKind::If(branch) => {
                    walk(ctx, &branch.body, acc);
                    let mut next = &branch.next;
                    while let Some(node) = next {
                        if let AstKind::If(inner) = &node.kind {
                            walk(ctx, &inner.body, acc);
                            next = &inner.next;
                        } else {
                            break;
                        }
                    }
                }
                AstKind::LoopWhile { body, .. }
                | AstKind::LoopIterator { body, .. }
                | AstKind::LoopNumeric { body, .. } => {
                    walk(ctx, body, acc);
                }
                _ => {}
            }
        }
    }

    let mut returns = Vec::new();
    walk(ctx, body, &mut returns);

    let mut result: *mut TypeObj = std::ptr::null_mut();
    for ty in returns {
        if ty.is_null() {
            continue;
        }
        result = if result.is_null() {
            ty
        } else if types::type_is_equal(result, ty) {
            result
        } else {
            types::make_or_extend_union(ctx, result, ty)
        };
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(source: &str) -> bool {
        let mut ctx = Context::new();
        let tokenizer = Tokenizer::new(source, "<test>");
        let mut parser = Parser::new(tokenizer);
        parser.parse(&mut ctx)
    }

    fn parse_err(source: &str) -> bool {
        !parse_ok(source)
    }

    #[test]
    fn test_let_with_inference() {
        assert!(parse_ok("let x = 1\nlet y: number = x"));
    }

    #[test]
    fn test_let_type_mismatch() {
        assert!(parse_err("let x: number = \"nope\""));
    }

    #[test]
    fn test_unknown_identifier() {
        assert!(parse_err("return missing"));
    }

    #[test]
    fn test_duplicate_binding() {
        assert!(parse_err("let x = 1\nlet x = 2"));
    }

    #[test]
    fn test_const_assignment_rejected() {
        assert!(parse_err("let const x = 1\nx = 2"));
    }

    #[test]
    fn test_function_literal_and_call() {
        assert!(parse_ok(
            "fn add(a: number, b: number): number { return a + b }\nreturn add(1, 2)"
        ));
    }

    #[test]
    fn test_call_arity_checked() {
        assert!(parse_err(
            "fn add(a: number, b: number): number { return a + b }\nreturn add(1)"
        ));
    }

    #[test]
    fn test_call_argument_type_checked() {
        assert!(parse_err(
            "fn add(a: number, b: number): number { return a + b }\nreturn add(1, \"two\")"
        ));
    }

    #[test]
    fn test_closure_upvalue_recorded() {
        let mut ctx = Context::new();
        let tokenizer = Tokenizer::new(
            "fn make(): fn: number { var n = 0 return fn: number { n += 1 return n } }",
            "<test>",
        );
        let mut parser = Parser::new(tokenizer);
        assert!(parser.parse(&mut ctx));

        // The inner literal must have captured exactly one upvalue.
        fn find_inner(node: &AstNode) -> Option<&Vec<ParseBinding>> {
            match &node.kind {
                AstKind::Module { body } => body.iter().find_map(find_inner),
                AstKind::Let {
                    initializer: Some(init),
                    ..
                } => find_inner(init),
                AstKind::Function { body, upvals, .. } => body
                    .iter()
                    .find_map(find_inner)
                    .or(if upvals.is_empty() { None } else { Some(upvals) }),
                AstKind::Return { expr: Some(expr) } => find_inner(expr),
                _ => None,
            }
        }
        let upvals = find_inner(parser.root.as_ref().unwrap()).expect("inner fn captures");
        assert_eq!(upvals.len(), 1);
        assert_eq!(upvals[0].name, "n");
    }

    #[test]
    fn test_if_let_requires_nullable() {
        assert!(parse_err("if let x = 1 { }"));
    }

    #[test]
    fn test_nullable_flow() {
        assert!(parse_ok(
            "fn first(a: [number]): number? { return a[0] }\nlet x = first([1]) ?? 0\nreturn x"
        ));
    }

    #[test]
    fn test_numeric_for_forms() {
        assert!(parse_ok("var sum = 0\nfor i in 10 { sum += i }\nreturn sum"));
        assert!(parse_ok("var s = 0\nfor i in 2 to 8 by 2 { s += i }\nreturn s"));
    }

    #[test]
    fn test_type_alias_and_cast() {
        assert!(parse_ok(
            "type V = { x: number, y: number }\nlet v = { x: 3, y: 4 } as V\nreturn v.x"
        ));
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(parse_err(
            "type V = { x: number }\nlet v = { x: 3 } as V\nreturn v.zz"
        ));
    }

    #[test]
    fn test_compose_duplicate_key_rejected() {
        assert!(parse_err(
            "type A = { x: number }\ntype B = { x: number }\ntype C = A + B"
        ));
    }

    #[test]
    fn test_enum_literal() {
        assert!(parse_ok(
            "type Color = enum { Red, Green, Blue }\nlet c = Color.Green\nreturn c is Color"
        ));
    }

    #[test]
    fn test_export_requires_declaration() {
        assert!(parse_err("export 1 + 2"));
    }
}
