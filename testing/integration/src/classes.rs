// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Demo user classes: the program-model definitions fed to the compiler, and
//! the wrappers a build-time generator would emit for them: original
//! methods plus the split functions named by the flow compiler.

use anyhow::anyhow;
use serde_json::{json, Value};

use stateflow::dataflow::{FlowMarker, InternalClassRef};
use stateflow::program::{
    CallExpr, ClassDef, ExprInfo, ForStmt, IfStmt, MethodDef, SimpleStmt, INIT_METHOD,
};
use stateflow::wrapper::{advance_iterator, ClassWrapper, InvocationResult};
use stateflow::{build_dataflow, Dataflow};
use stateflow_shared::{Arguments, State};

/// `User`: balance-holding account that buys items and iterates over peers.
pub fn user_class() -> ClassDef {
    ClassDef::new("User")
        .method(
            MethodDef::new(INIT_METHOD).param("username").stmt(
                SimpleStmt::new("self.username = username; self.balance = 0; self.items = []")
                    .uses(&["username"])
                    .writes_self("username")
                    .writes_self_typed("balance", "int")
                    .writes_self_typed("items", "List"),
            ),
        )
        .method(
            MethodDef::new("update_balance").param_typed("x", "int").stmt(
                SimpleStmt::new("self.balance += x")
                    .uses(&["x"])
                    .writes_self("balance"),
            ),
        )
        .method(
            MethodDef::new("buy_item")
                .param_typed("amount", "int")
                .param_typed("item", "Item")
                .stmt(
                    SimpleStmt::new("total_price = amount * item.price")
                        .assigns("total_price")
                        .uses(&["amount", "item"])
                        .reads_attr("item", "price"),
                )
                .stmt(
                    SimpleStmt::new("is_updated = item.update_stock(-amount)")
                        .assigns("is_updated")
                        .uses(&["item", "amount"])
                        .calls(
                            CallExpr::new("item", "update_stock").arg_using("-amount", &["amount"]),
                        ),
                )
                .stmt(
                    SimpleStmt::new("self.balance -= total_price")
                        .uses(&["total_price"])
                        .writes_self("balance"),
                )
                .stmt(
                    SimpleStmt::new("return is_updated")
                        .uses(&["is_updated"])
                        .returns(1),
                ),
        )
        .method(
            MethodDef::new("simple_for_loops")
                .param_typed("users", "List[User]")
                .stmt(SimpleStmt::new("i = 0").assigns("i").annotated("int"))
                .stmt(ForStmt::new(
                    "user",
                    ExprInfo::name("users"),
                    vec![SimpleStmt::new("i += 1").assigns("i").uses(&["i"]).into()],
                ))
                .stmt(SimpleStmt::new("return i").uses(&["i"]).returns(1)),
        )
        .method(
            MethodDef::new("conditional_restock")
                .param_typed("x", "int")
                .param_typed("item", "Item")
                .stmt(
                    SimpleStmt::new("before = item.stock")
                        .assigns("before")
                        .uses(&["item"])
                        .reads_attr("item", "stock"),
                )
                .stmt(
                    IfStmt::new(
                        ExprInfo::new("x > 0").uses(&["x"]),
                        vec![SimpleStmt::new("noop = 1").assigns("noop").into()],
                    )
                    .orelse(vec![SimpleStmt::new("item.update_stock(1)")
                        .uses(&["item"])
                        .calls(CallExpr::new("item", "update_stock").arg("1"))
                        .into()]),
                )
                .stmt(
                    SimpleStmt::new("ok = item.reserve(x)")
                        .assigns("ok")
                        .uses(&["item", "x"])
                        .calls(CallExpr::new("item", "reserve").arg_using("x", &["x"])),
                )
                .stmt(
                    SimpleStmt::new("after = item.stock")
                        .assigns("after")
                        .uses(&["item"])
                        .reads_attr("item", "stock"),
                )
                .stmt(
                    SimpleStmt::new("return after - before")
                        .uses(&["after", "before"])
                        .returns(1),
                ),
        )
        .method(
            MethodDef::new("restock_delta")
                .param_typed("item", "Item")
                .stmt(
                    SimpleStmt::new("before = item.stock")
                        .assigns("before")
                        .uses(&["item"])
                        .reads_attr("item", "stock"),
                )
                .stmt(
                    SimpleStmt::new("item.update_stock(1)")
                        .uses(&["item"])
                        .calls(CallExpr::new("item", "update_stock").arg("1")),
                )
                .stmt(
                    SimpleStmt::new("after = item.stock")
                        .assigns("after")
                        .uses(&["item"])
                        .reads_attr("item", "stock"),
                )
                .stmt(
                    SimpleStmt::new("return after - before")
                        .uses(&["after", "before"])
                        .returns(1),
                ),
        )
        .method(
            MethodDef::new("check_funds")
                .param_typed("x", "int")
                .param_typed("item", "Item")
                .stmt(
                    IfStmt::new(
                        ExprInfo::new("item.reserve(x)")
                            .uses(&["item", "x"])
                            .calls(CallExpr::new("item", "reserve").arg_using("x", &["x"])),
                        vec![SimpleStmt::new("return 0").returns(1).into()],
                    )
                    .elif(
                        ExprInfo::new("x > 0").uses(&["x"]),
                        vec![SimpleStmt::new("return 1").returns(1).into()],
                    )
                    .orelse(vec![SimpleStmt::new("return 2").returns(1).into()]),
                ),
        )
}

/// `Item`: a stocked product.
pub fn item_class() -> ClassDef {
    ClassDef::new("Item")
        .method(
            MethodDef::new(INIT_METHOD)
                .param("item_name")
                .param_typed("price", "int")
                .stmt(
                    SimpleStmt::new("self.item_name = item_name; self.price = price; self.stock = 0")
                        .uses(&["item_name", "price"])
                        .writes_self("item_name")
                        .writes_self_typed("price", "int")
                        .writes_self_typed("stock", "int"),
                ),
        )
        .method(
            MethodDef::new("update_stock")
                .param_typed("amount", "int")
                .stmt(
                    SimpleStmt::new("self.stock += amount")
                        .uses(&["amount"])
                        .writes_self("stock"),
                )
                .stmt(SimpleStmt::new("return True").returns(1)),
        )
        .method(
            MethodDef::new("reserve")
                .param_typed("x", "int")
                .stmt(
                    SimpleStmt::new("return x > 0 and self.stock >= x")
                        .uses(&["x"])
                        .returns(1),
                ),
        )
}

/// The demo registry, compiled end to end.
pub fn demo_dataflow() -> Dataflow {
    build_dataflow(&[item_class(), user_class()]).expect("demo classes extract cleanly")
}

fn int_arg(args: &Arguments, name: &str) -> Result<i64, InvocationResult> {
    args.get(name)
        .and_then(Value::as_i64)
        .ok_or_else(|| InvocationResult::failed(format!("{} expects an integer", name)))
}

fn ref_arg(args: &Arguments, name: &str) -> Result<InternalClassRef, InvocationResult> {
    args.get(name)
        .and_then(InternalClassRef::from_value)
        .ok_or_else(|| InvocationResult::failed(format!("{} is not a class reference", name)))
}

fn value_arg(args: &Arguments, name: &str) -> Result<Value, InvocationResult> {
    args.get(name)
        .cloned()
        .ok_or_else(|| InvocationResult::failed(format!("missing argument {}", name)))
}

pub struct UserInstance {
    username: String,
    balance: i64,
    items: Vec<Value>,
}

impl UserInstance {
    fn from_state(state: &State) -> Self {
        Self {
            username: state
                .get_attr("username")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            balance: state
                .get_attr("balance")
                .and_then(Value::as_i64)
                .unwrap_or(0),
            items: state
                .get_attr("items")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
        }
    }

    fn to_state(&self) -> State {
        [
            ("username".to_string(), json!(self.username)),
            ("balance".to_string(), json!(self.balance)),
            ("items".to_string(), Value::Array(self.items.clone())),
        ]
        .into_iter()
        .collect()
    }
}

pub struct UserWrapper;

impl ClassWrapper for UserWrapper {
    type Instance = UserInstance;

    fn init_class(&self, args: &Arguments) -> InvocationResult {
        let Some(username) = args.get("username").and_then(Value::as_str) else {
            return InvocationResult::failed("username is required");
        };
        let user = UserInstance {
            username: username.to_string(),
            balance: 0,
            items: Vec::new(),
        };
        InvocationResult::success(user.to_state(), vec![])
    }

    fn derive_key(&self, state: &State) -> anyhow::Result<String> {
        state
            .get_attr("username")
            .and_then(Value::as_str)
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("user state has no username"))
    }

    fn invoke_return_instance(
        &self,
        method: &str,
        state: &State,
        args: &Arguments,
    ) -> (InvocationResult, Option<UserInstance>) {
        let mut user = UserInstance::from_state(state);
        let result = self.invoke_with_instance(method, &mut user, args);
        (result, Some(user))
    }

    fn invoke_with_instance(
        &self,
        method: &str,
        user: &mut UserInstance,
        args: &Arguments,
    ) -> InvocationResult {
        match method {
            "update_balance" => {
                let x = match int_arg(args, "x") {
                    Ok(x) => x,
                    Err(failed) => return failed,
                };
                user.balance += x;
                InvocationResult::success(user.to_state(), vec![])
            }

            // buy_item, block 0: price the order and request the stock
            // update on the item's partition.
            "buy_item_0" => {
                let amount = match int_arg(args, "amount") {
                    Ok(v) => v,
                    Err(failed) => return failed,
                };
                let item = match ref_arg(args, "item") {
                    Ok(v) => v,
                    Err(failed) => return failed,
                };
                let Some(price) = item.attr("price").and_then(Value::as_i64) else {
                    return InvocationResult::failed("item snapshot has no price");
                };
                let total_price = amount * price;
                let request = FlowMarker::InvokeMethodRequest {
                    class_name: item.fun_type.name.clone(),
                    call_instance_ref: item.to_value(),
                    args: vec![json!(-amount)],
                };
                InvocationResult::read_only(vec![
                    json!(amount),
                    item.to_value(),
                    json!(total_price),
                    request.to_value(),
                ])
            }

            // buy_item, block 1: settle the balance and return the outcome.
            "buy_item_1" => {
                let outcome = match value_arg(args, "update_stock_return") {
                    Ok(v) => v,
                    Err(failed) => return failed,
                };
                let total_price = match int_arg(args, "total_price") {
                    Ok(v) => v,
                    Err(failed) => return failed,
                };
                user.balance -= total_price;
                InvocationResult::success(user.to_state(), vec![outcome])
            }

            // simple_for_loops, block 0: seed the counter and materialize the
            // iterable.
            "simple_for_loops_0" => {
                let users = match value_arg(args, "users") {
                    Ok(v) => v,
                    Err(failed) => return failed,
                };
                InvocationResult::read_only(vec![
                    users.clone(),
                    json!(0),
                    users,
                    FlowMarker::ForLoopSplit.to_value(),
                ])
            }
            // simple_for_loops, block 1: the loop iterator.
            "simple_for_loops_1" => {
                let iter = match value_arg(args, "iter_1") {
                    Ok(v) => v,
                    Err(failed) => return failed,
                };
                InvocationResult::read_only(advance_iterator(&iter))
            }
            // simple_for_loops, block 2: the loop body.
            "simple_for_loops_2" => {
                let i = match int_arg(args, "i") {
                    Ok(v) => v,
                    Err(failed) => return failed,
                };
                InvocationResult::read_only(vec![json!(i + 1), FlowMarker::ForLoopSplit.to_value()])
            }
            // simple_for_loops, block 3: after the loop.
            "simple_for_loops_3" => {
                let i = match value_arg(args, "i") {
                    Ok(v) => v,
                    Err(failed) => return failed,
                };
                InvocationResult::read_only(vec![i])
            }

            // conditional_restock, block 0: read the pre-branch stock.
            "conditional_restock_0" => {
                let x = match value_arg(args, "x") {
                    Ok(v) => v,
                    Err(failed) => return failed,
                };
                let item = match ref_arg(args, "item") {
                    Ok(v) => v,
                    Err(failed) => return failed,
                };
                let Some(before) = item.attr("stock").and_then(Value::as_i64) else {
                    return InvocationResult::failed("item snapshot has no stock");
                };
                InvocationResult::read_only(vec![
                    x,
                    item.to_value(),
                    json!(before),
                    FlowMarker::NormalSplit.to_value(),
                ])
            }
            // conditional_restock, block 1: the branch predicate.
            "conditional_restock_1" => {
                let x = match int_arg(args, "x") {
                    Ok(v) => v,
                    Err(failed) => return failed,
                };
                InvocationResult::read_only(vec![json!(x > 0)])
            }
            // conditional_restock, block 2: the no-op if body.
            "conditional_restock_2" => InvocationResult::read_only(vec![
                json!(1),
                FlowMarker::NormalSplit.to_value(),
            ]),
            // conditional_restock, block 3: request the restock in the else
            // arm.
            "conditional_restock_3" => {
                let item = match ref_arg(args, "item") {
                    Ok(v) => v,
                    Err(failed) => return failed,
                };
                let request = FlowMarker::InvokeMethodRequest {
                    class_name: item.fun_type.name.clone(),
                    call_instance_ref: item.to_value(),
                    args: vec![json!(1)],
                };
                InvocationResult::read_only(vec![item.to_value(), request.to_value()])
            }
            // conditional_restock, block 4: the else tail.
            "conditional_restock_4" => {
                let outcome = match value_arg(args, "update_stock_return") {
                    Ok(v) => v,
                    Err(failed) => return failed,
                };
                let item = match value_arg(args, "item") {
                    Ok(v) => v,
                    Err(failed) => return failed,
                };
                InvocationResult::read_only(vec![
                    outcome,
                    item,
                    FlowMarker::NormalSplit.to_value(),
                ])
            }
            // conditional_restock, block 5: the join requests the reserve
            // probe.
            "conditional_restock_5" => {
                let item = match ref_arg(args, "item") {
                    Ok(v) => v,
                    Err(failed) => return failed,
                };
                let x = match value_arg(args, "x") {
                    Ok(v) => v,
                    Err(failed) => return failed,
                };
                let request = FlowMarker::InvokeMethodRequest {
                    class_name: item.fun_type.name.clone(),
                    call_instance_ref: item.to_value(),
                    args: vec![x.clone()],
                };
                InvocationResult::read_only(vec![item.to_value(), x, request.to_value()])
            }
            // conditional_restock, block 6: read the refreshed stock.
            "conditional_restock_6" => {
                let item = match ref_arg(args, "item") {
                    Ok(v) => v,
                    Err(failed) => return failed,
                };
                let before = match int_arg(args, "before") {
                    Ok(v) => v,
                    Err(failed) => return failed,
                };
                let Some(after) = item.attr("stock").and_then(Value::as_i64) else {
                    return InvocationResult::failed("item snapshot has no stock");
                };
                InvocationResult::read_only(vec![json!(after - before)])
            }

            // restock_delta, block 0: read the stale stock and request the
            // restock.
            "restock_delta_0" => {
                let item = match ref_arg(args, "item") {
                    Ok(v) => v,
                    Err(failed) => return failed,
                };
                let Some(before) = item.attr("stock").and_then(Value::as_i64) else {
                    return InvocationResult::failed("item snapshot has no stock");
                };
                let request = FlowMarker::InvokeMethodRequest {
                    class_name: item.fun_type.name.clone(),
                    call_instance_ref: item.to_value(),
                    args: vec![json!(1)],
                };
                InvocationResult::read_only(vec![
                    item.to_value(),
                    json!(before),
                    request.to_value(),
                ])
            }
            // restock_delta, block 1: read the refreshed snapshot.
            "restock_delta_1" => {
                let item = match ref_arg(args, "item") {
                    Ok(v) => v,
                    Err(failed) => return failed,
                };
                let before = match int_arg(args, "before") {
                    Ok(v) => v,
                    Err(failed) => return failed,
                };
                let Some(after) = item.attr("stock").and_then(Value::as_i64) else {
                    return InvocationResult::failed("item snapshot has no stock");
                };
                InvocationResult::read_only(vec![json!(after - before)])
            }

            // check_funds, block 0: pass-through before the if-chain.
            "check_funds_0" => {
                let x = match value_arg(args, "x") {
                    Ok(v) => v,
                    Err(failed) => return failed,
                };
                let item = match value_arg(args, "item") {
                    Ok(v) => v,
                    Err(failed) => return failed,
                };
                InvocationResult::read_only(vec![x, item, FlowMarker::NormalSplit.to_value()])
            }
            // check_funds, block 1: evaluate the predicate's call.
            "check_funds_1" => {
                let item = match ref_arg(args, "item") {
                    Ok(v) => v,
                    Err(failed) => return failed,
                };
                let x = match value_arg(args, "x") {
                    Ok(v) => v,
                    Err(failed) => return failed,
                };
                let request = FlowMarker::InvokeMethodRequest {
                    class_name: item.fun_type.name.clone(),
                    call_instance_ref: item.to_value(),
                    args: vec![x.clone()],
                };
                InvocationResult::read_only(vec![item.to_value(), x, request.to_value()])
            }
            // check_funds, block 2: the if predicate.
            "check_funds_2" => {
                let outcome = match value_arg(args, "reserve_return") {
                    Ok(v) => v,
                    Err(failed) => return failed,
                };
                InvocationResult::read_only(vec![outcome])
            }
            "check_funds_3" => InvocationResult::read_only(vec![json!(0)]),
            // check_funds, block 4: the elif predicate.
            "check_funds_4" => {
                let x = match int_arg(args, "x") {
                    Ok(v) => v,
                    Err(failed) => return failed,
                };
                InvocationResult::read_only(vec![json!(x > 0)])
            }
            "check_funds_5" => InvocationResult::read_only(vec![json!(1)]),
            "check_funds_6" => InvocationResult::read_only(vec![json!(2)]),

            other => InvocationResult::failed(format!("User has no method {}", other)),
        }
    }
}

pub struct ItemInstance {
    item_name: String,
    price: i64,
    stock: i64,
}

impl ItemInstance {
    fn from_state(state: &State) -> Self {
        Self {
            item_name: state
                .get_attr("item_name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            price: state.get_attr("price").and_then(Value::as_i64).unwrap_or(0),
            stock: state.get_attr("stock").and_then(Value::as_i64).unwrap_or(0),
        }
    }

    fn to_state(&self) -> State {
        [
            ("item_name".to_string(), json!(self.item_name)),
            ("price".to_string(), json!(self.price)),
            ("stock".to_string(), json!(self.stock)),
        ]
        .into_iter()
        .collect()
    }
}

pub struct ItemWrapper;

impl ClassWrapper for ItemWrapper {
    type Instance = ItemInstance;

    fn init_class(&self, args: &Arguments) -> InvocationResult {
        let Some(item_name) = args.get("item_name").and_then(Value::as_str) else {
            return InvocationResult::failed("item_name is required");
        };
        let Some(price) = args.get("price").and_then(Value::as_i64) else {
            return InvocationResult::failed("price expects an integer");
        };
        let item = ItemInstance {
            item_name: item_name.to_string(),
            price,
            stock: 0,
        };
        InvocationResult::success(item.to_state(), vec![])
    }

    fn derive_key(&self, state: &State) -> anyhow::Result<String> {
        state
            .get_attr("item_name")
            .and_then(Value::as_str)
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("item state has no item_name"))
    }

    fn invoke_return_instance(
        &self,
        method: &str,
        state: &State,
        args: &Arguments,
    ) -> (InvocationResult, Option<ItemInstance>) {
        let mut item = ItemInstance::from_state(state);
        let result = self.invoke_with_instance(method, &mut item, args);
        (result, Some(item))
    }

    fn invoke_with_instance(
        &self,
        method: &str,
        item: &mut ItemInstance,
        args: &Arguments,
    ) -> InvocationResult {
        match method {
            "update_stock" => {
                let amount = match int_arg(args, "amount") {
                    Ok(v) => v,
                    Err(failed) => return failed,
                };
                if item.stock + amount < 0 {
                    return InvocationResult::read_only(vec![json!(false)]);
                }
                item.stock += amount;
                InvocationResult::success(item.to_state(), vec![json!(true)])
            }
            "reserve" => {
                let x = match int_arg(args, "x") {
                    Ok(v) => v,
                    Err(failed) => return failed,
                };
                InvocationResult::read_only(vec![json!(x > 0 && item.stock >= x)])
            }
            other => InvocationResult::failed(format!("Item has no method {}", other)),
        }
    }
}
