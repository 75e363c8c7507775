// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Expression arena for join keys and residual conjuncts.
//!
//! Responsibilities:
//! - Evaluates column references, literals, comparisons, and boolean logic
//!   over chunks, producing Arrow arrays.
//! - Provides the tri-state predicate evaluation used for join conjuncts
//!   (NULL counts as false in predicate position).

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, BooleanArray, BooleanBuilder};
use arrow::compute::kernels::boolean::not;
use arrow::compute::kernels::cmp::{eq, gt, gt_eq, lt, lt_eq, neq};
use arrow::compute::{is_not_null, is_null};
use arrow::datatypes::{DataType, SchemaRef};

use crate::exec::chunk::Chunk;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ExprId(pub usize);

#[derive(Clone, Debug)]
pub enum LiteralValue {
    Null(DataType),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Bool(bool),
    Utf8(String),
}

#[derive(Clone, Debug)]
pub enum ExprNode {
    Literal(LiteralValue),
    /// Column reference by position in the chunk's schema.
    Column(usize),
    Eq(ExprId, ExprId),
    /// Null-safe equality: NULL <=> NULL is true.
    EqForNull(ExprId, ExprId),
    Ne(ExprId, ExprId),
    Lt(ExprId, ExprId),
    Le(ExprId, ExprId),
    Gt(ExprId, ExprId),
    Ge(ExprId, ExprId),
    And(ExprId, ExprId),
    Or(ExprId, ExprId),
    Not(ExprId),
    IsNull(ExprId),
    IsNotNull(ExprId),
}

#[derive(Debug, Default)]
pub struct ExprArena {
    nodes: Vec<ExprNode>,
}

impl ExprArena {
    pub fn add(&mut self, node: ExprNode) -> ExprId {
        let id = ExprId(self.nodes.len());
        self.nodes.push(node);
        id
    }

    pub fn column(&mut self, index: usize) -> ExprId {
        self.add(ExprNode::Column(index))
    }

    fn node(&self, id: ExprId) -> Result<&ExprNode, String> {
        self.nodes
            .get(id.0)
            .ok_or_else(|| format!("expression id {} out of bounds", id.0))
    }

    /// Result type of `id` when evaluated against `schema`.
    pub fn data_type(&self, id: ExprId, schema: &SchemaRef) -> Result<DataType, String> {
        match self.node(id)? {
            ExprNode::Literal(value) => Ok(literal_data_type(value)),
            ExprNode::Column(index) => schema
                .fields()
                .get(*index)
                .map(|f| f.data_type().clone())
                .ok_or_else(|| format!("column index {index} not in row descriptor")),
            _ => Ok(DataType::Boolean),
        }
    }

    pub fn eval(&self, id: ExprId, chunk: &Chunk) -> Result<ArrayRef, String> {
        match self.node(id)? {
            ExprNode::Literal(value) => eval_literal(value, chunk.len()),
            ExprNode::Column(index) => chunk.column(*index),
            ExprNode::Eq(a, b) => {
                let (l, r) = self.eval_pair(*a, *b, chunk)?;
                let result = eq(&l, &r).map_err(|e| e.to_string())?;
                Ok(Arc::new(result))
            }
            ExprNode::EqForNull(a, b) => {
                let (l, r) = self.eval_pair(*a, *b, chunk)?;
                eval_null_safe_eq(&l, &r)
            }
            ExprNode::Ne(a, b) => {
                let (l, r) = self.eval_pair(*a, *b, chunk)?;
                let result = neq(&l, &r).map_err(|e| e.to_string())?;
                Ok(Arc::new(result))
            }
            ExprNode::Lt(a, b) => {
                let (l, r) = self.eval_pair(*a, *b, chunk)?;
                let result = lt(&l, &r).map_err(|e| e.to_string())?;
                Ok(Arc::new(result))
            }
            ExprNode::Le(a, b) => {
                let (l, r) = self.eval_pair(*a, *b, chunk)?;
                let result = lt_eq(&l, &r).map_err(|e| e.to_string())?;
                Ok(Arc::new(result))
            }
            ExprNode::Gt(a, b) => {
                let (l, r) = self.eval_pair(*a, *b, chunk)?;
                let result = gt(&l, &r).map_err(|e| e.to_string())?;
                Ok(Arc::new(result))
            }
            ExprNode::Ge(a, b) => {
                let (l, r) = self.eval_pair(*a, *b, chunk)?;
                let result = gt_eq(&l, &r).map_err(|e| e.to_string())?;
                Ok(Arc::new(result))
            }
            ExprNode::And(a, b) => self.eval_and(*a, *b, chunk),
            ExprNode::Or(a, b) => self.eval_or(*a, *b, chunk),
            ExprNode::Not(a) => {
                let v = self.eval(*a, chunk)?;
                let v_bool = as_boolean(&v, "NOT operand")?;
                let result = not(v_bool).map_err(|e| e.to_string())?;
                Ok(Arc::new(result))
            }
            ExprNode::IsNull(a) => {
                let v = self.eval(*a, chunk)?;
                let result = is_null(v.as_ref()).map_err(|e| e.to_string())?;
                Ok(Arc::new(result))
            }
            ExprNode::IsNotNull(a) => {
                let v = self.eval(*a, chunk)?;
                let result = is_not_null(v.as_ref()).map_err(|e| e.to_string())?;
                Ok(Arc::new(result))
            }
        }
    }

    /// Evaluate a boolean predicate, collapsing NULL to false.
    pub fn eval_predicate(&self, id: ExprId, chunk: &Chunk) -> Result<Vec<bool>, String> {
        let value = self.eval(id, chunk)?;
        let value_bool = as_boolean(&value, "predicate")?;
        let mut mask = Vec::with_capacity(value_bool.len());
        for row in 0..value_bool.len() {
            mask.push(!value_bool.is_null(row) && value_bool.value(row));
        }
        Ok(mask)
    }

    fn eval_pair(&self, a: ExprId, b: ExprId, chunk: &Chunk) -> Result<(ArrayRef, ArrayRef), String> {
        let l = self.eval(a, chunk)?;
        let r = self.eval(b, chunk)?;
        if l.data_type() != r.data_type() {
            return Err(format!(
                "cannot compare incompatible types: {:?} vs {:?}",
                l.data_type(),
                r.data_type()
            ));
        }
        Ok((l, r))
    }

    // SQL three-valued logic. Arrow's boolean kernels propagate NULL on both
    // sides, which loses FALSE-dominance for AND and TRUE-dominance for OR.
    fn eval_and(&self, a: ExprId, b: ExprId, chunk: &Chunk) -> Result<ArrayRef, String> {
        let l = self.eval(a, chunk)?;
        let r = self.eval(b, chunk)?;
        let l_bool = as_boolean(&l, "AND left operand")?;
        let r_bool = as_boolean(&r, "AND right operand")?;
        let mut builder = BooleanBuilder::new();
        for i in 0..l_bool.len() {
            match (l_bool.is_null(i), r_bool.is_null(i)) {
                (false, false) => builder.append_value(l_bool.value(i) && r_bool.value(i)),
                (false, true) => {
                    if !l_bool.value(i) {
                        builder.append_value(false);
                    } else {
                        builder.append_null();
                    }
                }
                (true, false) => {
                    if !r_bool.value(i) {
                        builder.append_value(false);
                    } else {
                        builder.append_null();
                    }
                }
                (true, true) => builder.append_null(),
            }
        }
        Ok(Arc::new(builder.finish()))
    }

    fn eval_or(&self, a: ExprId, b: ExprId, chunk: &Chunk) -> Result<ArrayRef, String> {
        let l = self.eval(a, chunk)?;
        let r = self.eval(b, chunk)?;
        let l_bool = as_boolean(&l, "OR left operand")?;
        let r_bool = as_boolean(&r, "OR right operand")?;
        let mut builder = BooleanBuilder::new();
        for i in 0..l_bool.len() {
            match (l_bool.is_null(i), r_bool.is_null(i)) {
                (false, false) => builder.append_value(l_bool.value(i) || r_bool.value(i)),
                (false, true) => {
                    if l_bool.value(i) {
                        builder.append_value(true);
                    } else {
                        builder.append_null();
                    }
                }
                (true, false) => {
                    if r_bool.value(i) {
                        builder.append_value(true);
                    } else {
                        builder.append_null();
                    }
                }
                (true, true) => builder.append_null(),
            }
        }
        Ok(Arc::new(builder.finish()))
    }
}

fn as_boolean<'a>(array: &'a ArrayRef, what: &str) -> Result<&'a BooleanArray, String> {
    array
        .as_any()
        .downcast_ref::<BooleanArray>()
        .ok_or_else(|| format!("{what} must be boolean, got {:?}", array.data_type()))
}

fn literal_data_type(value: &LiteralValue) -> DataType {
    match value {
        LiteralValue::Null(data_type) => data_type.clone(),
        LiteralValue::Int32(_) => DataType::Int32,
        LiteralValue::Int64(_) => DataType::Int64,
        LiteralValue::Float64(_) => DataType::Float64,
        LiteralValue::Bool(_) => DataType::Boolean,
        LiteralValue::Utf8(_) => DataType::Utf8,
    }
}

fn eval_literal(value: &LiteralValue, len: usize) -> Result<ArrayRef, String> {
    use arrow::array::{Float64Array, Int32Array, Int64Array, StringArray, new_null_array};
    let array: ArrayRef = match value {
        LiteralValue::Null(data_type) => new_null_array(data_type, len),
        LiteralValue::Int32(v) => Arc::new(Int32Array::from(vec![*v; len])),
        LiteralValue::Int64(v) => Arc::new(Int64Array::from(vec![*v; len])),
        LiteralValue::Float64(v) => Arc::new(Float64Array::from(vec![*v; len])),
        LiteralValue::Bool(v) => Arc::new(BooleanArray::from(vec![*v; len])),
        LiteralValue::Utf8(v) => Arc::new(StringArray::from(vec![v.as_str(); len])),
    };
    Ok(array)
}

fn eval_null_safe_eq(left: &ArrayRef, right: &ArrayRef) -> Result<ArrayRef, String> {
    let equal = eq(left, right).map_err(|e| e.to_string())?;
    let mut builder = BooleanBuilder::new();
    for i in 0..left.len() {
        match (left.is_null(i), right.is_null(i)) {
            (true, true) => builder.append_value(true),
            (true, false) | (false, true) => builder.append_value(false),
            (false, false) => builder.append_value(equal.value(i)),
        }
    }
    Ok(Arc::new(builder.finish()))
}
