// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Multi-hop event flow scenarios: split methods executing across partitions
//! through the in-memory substrate, including loops and conditionals.

use pretty_assertions::assert_eq;
use serde_json::json;

use stateflow::StatefulOperator;
use stateflow_integration_tests::classes::{demo_dataflow, ItemWrapper, UserWrapper};
use stateflow_integration_tests::tester::{expect_kind, return_results, Tester};
use stateflow_shared::event::Reply;
use stateflow_shared::serialization::JsonSerde;
use stateflow_shared::FunctionType;

fn setup() -> Tester {
    let dataflow = demo_dataflow();
    let mut tester = Tester::new(dataflow);
    tester.register(StatefulOperator::new(
        FunctionType::stateful("User"),
        UserWrapper,
        JsonSerde,
    ));
    tester.register(StatefulOperator::new(
        FunctionType::stateful("Item"),
        ItemWrapper,
        JsonSerde,
    ));
    tester
}

fn create_user(tester: &mut Tester, username: &str) {
    let reply = tester
        .init_class("User", json!({"username": username}))
        .unwrap();
    expect_kind(&reply, Reply::SuccessfulCreateClass);
}

fn create_item(tester: &mut Tester, name: &str, price: i64, stock: i64) {
    let reply = tester
        .init_class("Item", json!({"item_name": name, "price": price}))
        .unwrap();
    expect_kind(&reply, Reply::SuccessfulCreateClass);
    if stock != 0 {
        let reply = tester
            .invoke("Item", name, "update_stock", json!({"amount": stock}))
            .unwrap();
        expect_kind(&reply, Reply::SuccessfulInvocation);
    }
}

#[test]
fn buy_item_flows_across_two_partitions() {
    let mut tester = setup();
    create_user(&mut tester, "u1");
    create_item(&mut tester, "i1", 5, 4);
    tester
        .invoke("User", "u1", "update_balance", json!({"x": 20}))
        .unwrap();

    let item_ref = tester.class_ref("Item", "i1").unwrap();
    let reply = tester
        .invoke_flow(
            "User",
            "u1",
            "buy_item",
            vec![("amount", json!(3)), ("item", item_ref)],
        )
        .unwrap();

    expect_kind(&reply, Reply::SuccessfulInvocation);
    assert_eq!(return_results(&reply), json!(true));

    // Both partitions persisted their side of the purchase.
    let user = tester.state_of("User", "u1").unwrap().unwrap();
    assert_eq!(user.get_attr("balance"), Some(&json!(5)));
    let item = tester.state_of("Item", "i1").unwrap().unwrap();
    assert_eq!(item.get_attr("stock"), Some(&json!(1)));
}

#[test]
fn for_loop_counts_every_element() {
    let mut tester = setup();
    for name in ["u1", "u2", "u3", "u4"] {
        create_user(&mut tester, name);
    }

    let users = json!([
        tester.class_ref("User", "u1").unwrap(),
        tester.class_ref("User", "u2").unwrap(),
        tester.class_ref("User", "u3").unwrap(),
        tester.class_ref("User", "u4").unwrap(),
    ]);
    let reply = tester
        .invoke_flow("User", "u1", "simple_for_loops", vec![("users", users)])
        .unwrap();

    expect_kind(&reply, Reply::SuccessfulInvocation);
    assert_eq!(return_results(&reply), json!(4));
}

#[test]
fn for_loop_over_empty_list_skips_the_body() {
    let mut tester = setup();
    create_user(&mut tester, "u1");

    let reply = tester
        .invoke_flow("User", "u1", "simple_for_loops", vec![("users", json!([]))])
        .unwrap();

    expect_kind(&reply, Reply::SuccessfulInvocation);
    assert_eq!(return_results(&reply), json!(0));
}

#[test]
fn conditional_flow_takes_the_if_branch() {
    let mut tester = setup();
    create_user(&mut tester, "u1");
    create_item(&mut tester, "i1", 5, 5);

    let item_ref = tester.class_ref("Item", "i1").unwrap();
    let reply = tester
        .invoke_flow(
            "User",
            "u1",
            "check_funds",
            vec![("x", json!(3)), ("item", item_ref)],
        )
        .unwrap();

    expect_kind(&reply, Reply::SuccessfulInvocation);
    assert_eq!(return_results(&reply), json!(0));
}

#[test]
fn conditional_flow_takes_the_elif_branch() {
    let mut tester = setup();
    create_user(&mut tester, "u1");
    create_item(&mut tester, "i1", 5, 5);

    // More than the available stock, but a positive request.
    let item_ref = tester.class_ref("Item", "i1").unwrap();
    let reply = tester
        .invoke_flow(
            "User",
            "u1",
            "check_funds",
            vec![("x", json!(10)), ("item", item_ref)],
        )
        .unwrap();

    expect_kind(&reply, Reply::SuccessfulInvocation);
    assert_eq!(return_results(&reply), json!(1));
}

#[test]
fn conditional_flow_takes_the_else_branch() {
    let mut tester = setup();
    create_user(&mut tester, "u1");
    create_item(&mut tester, "i1", 5, 5);

    let item_ref = tester.class_ref("Item", "i1").unwrap();
    let reply = tester
        .invoke_flow(
            "User",
            "u1",
            "check_funds",
            vec![("x", json!(-5)), ("item", item_ref)],
        )
        .unwrap();

    expect_kind(&reply, Reply::SuccessfulInvocation);
    assert_eq!(return_results(&reply), json!(2));
}

#[test]
fn snapshot_is_refreshed_after_an_invalidating_call() {
    let mut tester = setup();
    create_user(&mut tester, "u1");
    create_item(&mut tester, "i1", 5, 4);

    // restock_delta reads stock, restocks by one, and reads again: the
    // second read must see the write, so a fresh snapshot is fetched on the
    // owning partition mid-flow.
    let item_ref = tester.class_ref("Item", "i1").unwrap();
    let reply = tester
        .invoke_flow("User", "u1", "restock_delta", vec![("item", item_ref)])
        .unwrap();

    expect_kind(&reply, Reply::SuccessfulInvocation);
    assert_eq!(return_results(&reply), json!(1));
    let item = tester.state_of("Item", "i1").unwrap().unwrap();
    assert_eq!(item.get_attr("stock"), Some(&json!(5)));
}

#[test]
fn join_read_sees_the_write_from_the_taken_branch() {
    let mut tester = setup();
    create_user(&mut tester, "u1");
    create_item(&mut tester, "i1", 5, 4);

    // conditional_restock reads stock, restocks only in the else arm, and
    // reads again after the join: the post-join read must be a fresh
    // snapshot even though only one branch invalidated it.
    let item_ref = tester.class_ref("Item", "i1").unwrap();
    let reply = tester
        .invoke_flow(
            "User",
            "u1",
            "conditional_restock",
            vec![("x", json!(0)), ("item", item_ref)],
        )
        .unwrap();

    expect_kind(&reply, Reply::SuccessfulInvocation);
    assert_eq!(return_results(&reply), json!(1));
    let item = tester.state_of("Item", "i1").unwrap().unwrap();
    assert_eq!(item.get_attr("stock"), Some(&json!(5)));
}

#[test]
fn join_read_on_the_untouched_branch_sees_no_change() {
    let mut tester = setup();
    create_user(&mut tester, "u1");
    create_item(&mut tester, "i1", 5, 4);

    let item_ref = tester.class_ref("Item", "i1").unwrap();
    let reply = tester
        .invoke_flow(
            "User",
            "u1",
            "conditional_restock",
            vec![("x", json!(3)), ("item", item_ref)],
        )
        .unwrap();

    expect_kind(&reply, Reply::SuccessfulInvocation);
    assert_eq!(return_results(&reply), json!(0));
    let item = tester.state_of("Item", "i1").unwrap().unwrap();
    assert_eq!(item.get_attr("stock"), Some(&json!(4)));
}

#[test]
fn flow_against_an_unknown_key_replies_key_not_found() {
    let mut tester = setup();
    create_user(&mut tester, "u1");

    let ghost = tester.class_ref("Item", "ghost").unwrap();
    let reply = tester
        .invoke_flow(
            "User",
            "u1",
            "buy_item",
            vec![("amount", json!(1)), ("item", ghost)],
        )
        .unwrap();

    expect_kind(&reply, Reply::KeyNotFound);
}

#[test]
fn failed_user_code_in_a_flow_becomes_a_failed_invocation() {
    let mut tester = setup();
    create_user(&mut tester, "u1");
    create_item(&mut tester, "i1", 5, 4);

    // A non-integer amount makes the first split function fail; the flow is
    // abandoned and neither partition commits anything.
    let item_ref = tester.class_ref("Item", "i1").unwrap();
    let reply = tester
        .invoke_flow(
            "User",
            "u1",
            "buy_item",
            vec![("amount", json!("three")), ("item", item_ref)],
        )
        .unwrap();

    expect_kind(&reply, Reply::FailedInvocation);
    let item = tester.state_of("Item", "i1").unwrap().unwrap();
    assert_eq!(item.get_attr("stock"), Some(&json!(4)));
    let user = tester.state_of("User", "u1").unwrap().unwrap();
    assert_eq!(user.get_attr("balance"), Some(&json!(0)));
}
