use objtable::FastRwLock;
use std::{sync::Arc, thread};

fn main() {
    let counter = Arc::new(FastRwLock::new(0));

    let writer = thread::spawn({
        let counter = counter.clone();
        move || {
            for _ in 0..1000 {
                *counter.wrlock() += 1;
            }
        }
    });

    for _ in 0..1000 {
        println!("read {}", *counter.rdlock());
    }

    writer.join().unwrap();

    assert_eq!(*counter.rdlock(), 1000);
}
