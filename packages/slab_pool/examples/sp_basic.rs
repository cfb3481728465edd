//! Basic usage of the `slab_pool` crate:
//!
//! * Creating a pool.
//! * Renting blocks and writing to them.
//! * Sharing a block between consumers.
//! * Returning blocks to the pool and reusing them.

use slab_pool::Pool;

fn main() -> Result<(), slab_pool::Error> {
    let pool = Pool::builder().slab_size(16 * 1024).build();

    // Renting gives you a block of at least the requested size, rounded up to a size class.
    let mut request = pool.rent(1200)?;
    println!(
        "Rented a block of {} bytes at offset {} for a 1200 byte request",
        request.len(),
        request.offset()
    );

    let message = b"hello from the pool";
    request
        .as_mut_bytes()?
        .get_mut(..message.len())
        .expect("block is larger than the message")
        .copy_from_slice(message);

    // A retained lease shares the same memory. The block returns to the pool only after
    // every lease has been released.
    let audit_copy = request.retain()?;
    println!("Block now has {} leases", request.reference_count());

    let still_alive = request.release();
    println!("After releasing the first lease, the block is still alive: {still_alive}");

    let text = audit_copy
        .as_bytes()?
        .get(..message.len())
        .expect("block is larger than the message");
    println!("Second lease reads: {}", String::from_utf8_lossy(text));

    drop(audit_copy);

    // The next request of the same size class reuses the block.
    let reused = pool.rent(2000)?;
    println!(
        "Rented again at offset {}, pool stats: {:?}",
        reused.offset(),
        pool.stats()
    );

    Ok(())
}
