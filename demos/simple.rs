use fairtree_db::Tree;
use std::{sync::Arc, thread};

fn main() {
    let tree = Arc::new(Tree::new());

    let writer = thread::spawn({
        let tree = tree.clone();
        move || {
            for i in 0..1000 {
                let _ = tree.add(&format!("key{i}"), &format!("value{i}"));
            }
        }
    });

    for i in 0..1000 {
        let _ = tree.query(&format!("key{i}"));
    }

    writer.join().unwrap();

    assert_eq!(
        tree.query("key999").unwrap(),
        fairtree_db::QueryOutcome::Found("value999".to_owned())
    );
}
