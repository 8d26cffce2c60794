//! Example: timers, repeats, and sleeping tasks

use pulsus::time::sleep;
use pulsus::Driver;

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

#[pulsus::main]
async fn main() {
    let driver = Driver::current();

    let ticks = Rc::new(Cell::new(0));
    let counter = ticks.clone();
    let repeat = driver.repeat(Duration::from_millis(100), move |_, id| {
        counter.set(counter.get() + 1);
        println!("Tick {} from callback {id}", counter.get());
        Ok(())
    });

    driver.delay(Duration::from_millis(250), |_, _| {
        println!("One-shot delay fired");
        Ok(())
    });

    // Wait asynchronously for half a second
    println!("Waiting for 500ms...");
    sleep(Duration::from_millis(500)).await;

    driver.cancel(repeat);
    println!("Done after {} ticks!", ticks.get());
}
